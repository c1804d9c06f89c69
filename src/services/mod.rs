pub mod address;
pub mod browse;
pub mod lan_url;
pub mod scanner;
pub mod subnet;
pub mod upstream;
