pub mod definition;
pub mod instance;
pub mod maintenance;
pub mod stream;
