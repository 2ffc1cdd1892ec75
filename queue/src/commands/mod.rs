pub(crate) mod dead;
pub(crate) mod job;
pub(crate) mod queue;
pub(crate) mod shared;

pub(crate) use dead::{dead_list, dead_retry};
pub(crate) use job::{JobSubmitOptions, job_show, job_submit};
pub(crate) use queue::{queue_groups, queue_monitor, queue_purge, queue_reap, queue_stats};
