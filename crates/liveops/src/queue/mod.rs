pub mod side_effect_queue;
pub mod transaction_log;
pub mod work_queue;

pub use side_effect_queue::{SideEffectQueue, TriggerSink};
pub use transaction_log::TransactionLog;
pub use work_queue::ShardedWorkQueue;
