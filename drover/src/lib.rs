pub mod audit;
pub mod backends;
pub mod config;
pub mod continuation;
pub mod fs;
pub mod invoker;
pub mod locks;
pub mod logging;
pub mod notify;
pub mod process;
pub mod queue;
pub mod scheduler;
pub mod sessions;
pub mod supervisor;
pub mod turn;
pub mod validation;
pub mod watcher;
