pub mod llm;
pub mod rows;
pub mod warehouse;
