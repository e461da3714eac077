//! On-demand service spawning.
//!
//! The spawned program inherits one end of a socketpair and is told about
//! it with two trailing arguments, `-ondemand <fd>`. The daemon keeps the
//! other end and admits it as if it were a freshly accepted client.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::process::Command;

use tokio::net::UnixStream;

use crate::config::OnDemandService;

/// Clear the close-on-exec flag so the fd survives into the child.
fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Spawn `entry`'s program connected to the daemon by a socketpair.
///
/// Returns the daemon's end, ready to be admitted as a client. The child is
/// deliberately not awaited; the daemon's relationship to it is the socket,
/// nothing more.
pub fn spawn_on_demand(entry: &OnDemandService) -> io::Result<UnixStream> {
    let (ours, theirs) = StdUnixStream::pair()?;
    clear_cloexec(theirs.as_raw_fd())?;

    let child = Command::new(&entry.program)
        .args(&entry.argv[1..])
        .arg("-ondemand")
        .arg(theirs.as_raw_fd().to_string())
        .spawn()?;

    tracing::info!(
        service = %entry.service_name,
        program = %entry.program,
        pid = child.id(),
        "spawned on-demand service"
    );
    drop(theirs);

    ours.set_nonblocking(true)?;
    UnixStream::from_std(ours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn child_inherits_a_usable_socket() {
        // The child sees `… -ondemand <fd>` appended; with `sh -c script
        // probe` those land in $1/$2, and the script writes back through
        // the inherited descriptor.
        let entry = OnDemandService {
            service_name: "probe".into(),
            program: "/bin/sh".into(),
            argv: vec![
                "/bin/sh".into(),
                "-c".into(),
                r#"eval "printf ok >&$2""#.into(),
                "probe".into(),
            ],
        };

        let mut stream = spawn_on_demand(&entry).unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn missing_program_errors() {
        let entry = OnDemandService {
            service_name: "ghost".into(),
            program: "/nonexistent/program".into(),
            argv: vec!["/nonexistent/program".into()],
        };
        assert!(spawn_on_demand(&entry).is_err());
    }
}
