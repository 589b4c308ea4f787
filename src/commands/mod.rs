pub mod apply_staged;
pub mod check;
pub mod clean;
pub mod install;
pub mod self_update;
pub mod status;
