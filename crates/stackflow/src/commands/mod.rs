pub mod delete;
pub mod machine;
pub mod reconcile;
pub mod status;
pub mod validate;
