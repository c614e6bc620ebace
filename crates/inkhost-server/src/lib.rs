pub mod admin;
pub mod catalog_store;
pub mod ssr_proxy;
pub mod state;
