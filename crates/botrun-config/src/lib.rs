pub mod account;
pub mod configuration;
pub mod encoder;
pub mod persist;
pub mod proxy;
pub mod script;
pub mod world;

pub use account::Account;
pub use configuration::{AUTOLOGIN_FLAG, Configuration, RunState};
pub use proxy::Proxy;
pub use script::Script;
pub use world::{StaticWorldCatalog, World, WorldCatalog};

/// Anything that contributes its own tokens to the client command line.
pub trait Parameter {
    fn to_parameter(&self) -> Vec<String>;
}
