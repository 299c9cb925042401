//! Await/poll primitives over the cloud capability ports
//!
//! Cloud resources move through lifecycle enums asynchronously; every
//! controller operation that creates or mutates a resource polls it until a
//! target state, a fatal terminal state, or the deadline. Retryable
//! transport errors are swallowed inside the loop.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::cloud::{
    AttachmentLifecycle, BackupLifecycle, BlockStorage, Compute, FileStorage, FssLifecycle,
    Volume, VolumeAttachment, VolumeBackup, VolumeLifecycle,
};
use crate::error::{Error, Result};

/// Fixed interval between lifecycle polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Ceiling applied to every controller-side cloud operation.
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(180);

/// Short window for backup availability; on expiry the snapshot is returned
/// not-ready and the orchestrator re-polls.
pub const BACKUP_AVAILABLE_TIMEOUT: Duration = Duration::from_secs(45);

/// Verdict of one lifecycle poll.
pub enum Poll {
    Ready,
    Pending,
    Fatal(String),
}

/// Polls `fetch` at [`POLL_INTERVAL`] until `check` reports the resource
/// ready, a fatal state is reached, or `deadline` expires.
pub async fn await_state<T, F, Fut>(
    what: &str,
    deadline: Duration,
    mut fetch: F,
    check: impl Fn(&T) -> Poll,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let loop_body = async {
        loop {
            match fetch().await {
                Ok(resource) => match check(&resource) {
                    Poll::Ready => return Ok(resource),
                    Poll::Fatal(state) => {
                        return Err(Error::UnexpectedLifecycleState {
                            kind: what.to_string(),
                            id: String::new(),
                            target: "target state".to_string(),
                            state,
                        })
                    }
                    Poll::Pending => {}
                },
                Err(err) if err.is_retryable() => {
                    warn!(what, error = %err, "transient error while polling, retrying");
                }
                Err(err) => return Err(err),
            }
            sleep(POLL_INTERVAL).await;
        }
    };

    match timeout(deadline, loop_body).await {
        Ok(result) => result,
        Err(_) => Err(Error::DeadlineExceeded(what.to_string())),
    }
}

/// Retries a cloud mutation a bounded number of times on retryable errors,
/// with exponential spacing (1s, 2s, 4s...).
pub async fn with_retry<T, F, Fut>(max_attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build();
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                attempt += 1;
                if let Some(delay) = policy.next_backoff() {
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying cloud call");
                    sleep(delay).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn volume_poll(volume: &Volume, require_hydrated: bool) -> Poll {
    match volume.lifecycle_state {
        VolumeLifecycle::Available => {
            if require_hydrated && !volume.is_hydrated {
                Poll::Pending
            } else {
                Poll::Ready
            }
        }
        VolumeLifecycle::Faulty | VolumeLifecycle::Terminated | VolumeLifecycle::Terminating => {
            Poll::Fatal(format!("{:?}", volume.lifecycle_state))
        }
        _ => Poll::Pending,
    }
}

/// Awaits a block volume reaching `AVAILABLE`.
pub async fn await_volume_available(client: &dyn BlockStorage, id: &str) -> Result<Volume> {
    await_state(
        "volume",
        OPERATION_TIMEOUT,
        || client.get_volume(id),
        |v| volume_poll(v, false),
    )
    .await
}

/// Awaits a cloned block volume reaching `AVAILABLE` with hydration done.
pub async fn await_clone_available(client: &dyn BlockStorage, id: &str) -> Result<Volume> {
    await_state(
        "volume clone",
        OPERATION_TIMEOUT,
        || client.get_volume(id),
        |v| volume_poll(v, true),
    )
    .await
}

/// Awaits a volume attachment reaching the given lifecycle state.
pub async fn await_attachment_state(
    client: &dyn Compute,
    id: &str,
    target: AttachmentLifecycle,
) -> Result<VolumeAttachment> {
    await_state(
        "volume attachment",
        OPERATION_TIMEOUT,
        || client.get_volume_attachment(id),
        |a| {
            if a.lifecycle_state == target {
                Poll::Ready
            } else {
                Poll::Pending
            }
        },
    )
    .await
}

/// Awaits a volume backup reaching `AVAILABLE` within `deadline`.
pub async fn await_backup_available(
    client: &dyn BlockStorage,
    id: &str,
    deadline: Duration,
) -> Result<VolumeBackup> {
    await_state(
        "volume backup",
        deadline,
        || client.get_volume_backup(id),
        |b| match b.lifecycle_state {
            BackupLifecycle::Available => Poll::Ready,
            BackupLifecycle::Faulty
            | BackupLifecycle::Terminated
            | BackupLifecycle::Terminating => Poll::Fatal(format!("{:?}", b.lifecycle_state)),
            _ => Poll::Pending,
        },
    )
    .await
}

fn fss_poll(state: FssLifecycle) -> Poll {
    match state {
        FssLifecycle::Active => Poll::Ready,
        FssLifecycle::Failed | FssLifecycle::Deleted | FssLifecycle::Deleting => {
            Poll::Fatal(format!("{:?}", state))
        }
        _ => Poll::Pending,
    }
}

/// Awaits a file system reaching `ACTIVE`.
pub async fn await_file_system_active(
    client: &dyn FileStorage,
    id: &str,
) -> Result<crate::cloud::FileSystem> {
    await_state(
        "file system",
        OPERATION_TIMEOUT,
        || client.get_file_system(id),
        |fs| fss_poll(fs.lifecycle_state),
    )
    .await
}

/// Awaits a mount target reaching `ACTIVE`.
pub async fn await_mount_target_active(
    client: &dyn FileStorage,
    id: &str,
) -> Result<crate::cloud::MountTarget> {
    await_state(
        "mount target",
        OPERATION_TIMEOUT,
        || client.get_mount_target(id),
        |mt| fss_poll(mt.lifecycle_state),
    )
    .await
}

/// Awaits an export reaching `ACTIVE`.
pub async fn await_export_active(
    client: &dyn FileStorage,
    id: &str,
) -> Result<crate::cloud::Export> {
    await_state(
        "export",
        OPERATION_TIMEOUT,
        || client.get_export(id),
        |e| fss_poll(e.lifecycle_state),
    )
    .await
}
