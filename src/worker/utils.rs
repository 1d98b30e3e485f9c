// Channel fd placement follows the worker contract: 3 commands in,
// 4 replies out, 5 payloads in, 6 payloads out.

use crate::worker::channel::Channel;
use crate::worker::payload_channel::PayloadChannel;
use async_executor::Executor;
use async_fs::File;
use async_process::unix::CommandExt;
use async_process::{Child, Command};
use nix::unistd;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

// Spawning workers from multiple threads concurrently races on fd
// inheritance, take a lock around the whole procedure.
static SPAWNING: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub(super) struct SpawnResult {
    pub(super) child: Child,
    pub(super) channel: Channel,
    pub(super) payload_channel: PayloadChannel,
}

fn pipe() -> io::Result<(RawFd, RawFd)> {
    unistd::pipe().map_err(|error| io::Error::new(io::ErrorKind::Other, error))
}

pub(super) fn spawn_with_worker_channels(
    executor: Arc<Executor<'static>>,
    command: &mut Command,
    request_timeout: Duration,
) -> io::Result<SpawnResult> {
    let _lock = SPAWNING.lock();

    let (producer_fd_read, producer_fd_write) = pipe()?;
    let (consumer_fd_read, consumer_fd_write) = pipe()?;
    let (producer_payload_fd_read, producer_payload_fd_write) = pipe()?;
    let (consumer_payload_fd_read, consumer_payload_fd_write) = pipe()?;

    unsafe {
        command.pre_exec(move || {
            if libc::dup2(producer_fd_read, 3) == -1
                || libc::dup2(consumer_fd_write, 4) == -1
                || libc::dup2(producer_payload_fd_read, 5) == -1
                || libc::dup2(consumer_payload_fd_write, 6) == -1
            {
                return Err(io::Error::last_os_error());
            }
            // The child inherited every pipe end; keep only fds 3..=6.
            for fd in &[
                producer_fd_read,
                producer_fd_write,
                consumer_fd_read,
                consumer_fd_write,
                producer_payload_fd_read,
                producer_payload_fd_write,
                consumer_payload_fd_read,
                consumer_payload_fd_write,
            ] {
                if *fd > 6 {
                    libc::close(*fd);
                }
            }
            Ok(())
        });
    }

    let child = command.spawn()?;

    // Parent side: close the child's ends.
    for fd in &[
        producer_fd_read,
        consumer_fd_write,
        producer_payload_fd_read,
        consumer_payload_fd_write,
    ] {
        let _ = unistd::close(*fd);
    }

    let producer_file = unsafe { File::from_raw_fd(producer_fd_write) };
    let consumer_file = unsafe { File::from_raw_fd(consumer_fd_read) };
    let producer_payload_file = unsafe { File::from_raw_fd(producer_payload_fd_write) };
    let consumer_payload_file = unsafe { File::from_raw_fd(consumer_payload_fd_read) };

    Ok(SpawnResult {
        child,
        channel: Channel::new(
            Arc::clone(&executor),
            consumer_file,
            producer_file,
            request_timeout,
        ),
        payload_channel: PayloadChannel::new(
            executor,
            consumer_payload_file,
            producer_payload_file,
        ),
    })
}
