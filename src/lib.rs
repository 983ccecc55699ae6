pub mod appcontext;
pub mod certissuer;
pub mod config;
pub mod crd;
pub mod error;
pub mod intent;
pub mod inventory;
pub mod operator;
pub mod rsync;
pub mod state;
pub mod store;
