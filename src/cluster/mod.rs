pub mod assignment;
pub mod controller;
pub mod settings;
pub mod slave;
pub mod slave_server;

pub use assignment::ShardAssignmentTable;
pub use controller::{ClusterController, ControllerState, ShutdownHook};
pub use settings::ControllerSettings;
pub use slave::{SlaveHandle, SlaveState, dial_with_retry};
pub use slave_server::{SlaveServer, SlaveServerHandle};
