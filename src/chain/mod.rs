pub mod change_log;
pub mod config;
pub mod manager;
pub mod state;

pub use change_log::{HotChangeRecorder, LoggedChange, LoggedRow, LoggedValue};
pub use config::ChainConfig;
pub use manager::ChainTransactionManager;
pub use state::{BlockRef, ChainState, ChainStatus, FinalTxInfo, HotTxInfo};
