pub mod dispatch_worker;
pub mod expiration_task;
pub mod manager;
pub mod notification_worker;

pub use dispatch_worker::{DispatchWorker, IterationReport};
pub use expiration_task::ExpirationTask;
pub use manager::Manager;
pub use notification_worker::{ClientNotifyFn, NotificationWorker};
