mod clock;
pub mod factory;
pub mod job_monitor;
pub mod scheduler;
pub mod session;
pub mod session_manager;

#[cfg(test)]
pub(crate) mod testing;

pub mod prelude {
    #[rustfmt::skip]
    pub use super::{
        factory::SchedulerFactory,
        job_monitor::{JobMonitor, MonitorEvent},
        scheduler::{
            Admitted, AdmissionError, PolicyReport, Rejected, SchedulerManager, SchedulerParams,
        },
        session::{ControlResponse, ProgramStatus, Session, SyncResponse},
        session_manager::SessionManager,
    };
}
