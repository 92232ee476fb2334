mod gvnative;
mod swp08;
mod videohub;

pub use gvnative::GvNativeFrontend;
pub use swp08::Swp08Frontend;
pub use videohub::VideohubFrontend;
