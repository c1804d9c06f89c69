// Library entrypoint for the server binary and integration tests.
mod api;
mod core;
mod services;

pub use api::build_router;
pub use self::core::{config, error, shutdown, state};
pub use services::{address, browse, lan_url, scanner, subnet, upstream};
