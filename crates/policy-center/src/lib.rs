pub mod api;
pub mod errors;
pub mod model;

pub use api::{BasePolicy, StaticPolicy};
pub use errors::PolicyError;
pub use model::{OriginRule, PolicyRules, PrincipalRule};
