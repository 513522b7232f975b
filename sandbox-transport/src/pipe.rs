//! A connected pair of byte streams, built with `socketpair(2)`, standing in
//! for the control-stream endpoint in tests without needing a real listening
//! socket on disk.

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

pub struct Endpoint {
    fd: std::os::fd::OwnedFd,
}

pub fn pipe() -> std::io::Result<(Endpoint, Endpoint)> {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )?;

    Ok((Endpoint { fd: a }, Endpoint { fd: b }))
}

impl std::io::Read for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(nix::unistd::read(&self.fd, buf)?)
    }
}

impl std::io::Write for Endpoint {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(nix::unistd::write(&self.fd, buf)?)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn writes_on_one_end_are_readable_on_the_other() {
        let (mut a, mut b) = pipe().unwrap();
        a.write_all(b"READY\n").unwrap();
        let mut buf = [0u8; 6];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"READY\n");
    }
}
