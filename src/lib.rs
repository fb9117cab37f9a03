pub mod agents;
pub mod config;
pub mod console;
pub mod graph;
pub mod llm;
pub mod orchestrator;
pub mod state;
pub mod tools;
