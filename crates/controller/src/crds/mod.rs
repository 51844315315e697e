pub mod build;
pub mod template;
pub mod validation;

pub use build::*;
pub use template::*;
pub use validation::ValidationError;
