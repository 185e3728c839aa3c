pub mod context;
pub mod fixer;
pub mod generator;
pub mod matcher;
pub mod patcher;
pub mod profiler;
pub mod selector;
