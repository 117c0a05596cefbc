pub mod entry;
pub mod gateway;
pub mod sid;

pub use gateway::{LdapGateway, LdapGatewayOptions, LdapGatewayOptionsBuilder};
