pub mod assets;
pub mod description;
pub mod events;
pub mod outcome;
pub mod report;
