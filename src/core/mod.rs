pub mod stages;
pub mod supervisor;
