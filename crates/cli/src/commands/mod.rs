pub mod binary;
pub mod run;
pub mod segments;

pub use binary::*;
pub use run::*;
pub use segments::*;
