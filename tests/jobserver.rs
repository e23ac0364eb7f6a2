use jobcrew::{parse_makeflags, Client, Error, JobserverConfig, Pool, Slot};

#[test]
fn pool_rejects_tiny_slot_counts() {
    assert!(matches!(Pool::new(0), Err(Error::InvalidSlotCount(0))));
    assert!(matches!(Pool::new(1), Err(Error::InvalidSlotCount(1))));
}

#[test]
fn pool_buffers_one_token_less_than_its_slots() {
    let pool = Pool::new(4).unwrap();
    assert_eq!(pool.slots(), 4);
    assert_eq!(pool.available().unwrap(), 3);

    let fragment = pool.env_fragment();
    assert!(fragment.starts_with(" -j4 "));
    #[cfg(unix)]
    {
        // Both spellings, for tooling from before the rename.
        assert!(fragment.contains("--jobserver-fds="));
        assert!(fragment.contains("--jobserver-auth="));
    }
}

#[test]
fn round_trip_pool_to_client() {
    let pool = Pool::new(4).unwrap();
    let config = parse_makeflags(pool.env_fragment()).unwrap();
    let mut client = unsafe { Client::from_config(&config) }.unwrap().unwrap();

    // The implicit slot comes first and costs no I/O.
    assert_eq!(client.try_acquire(), Slot::Implicit);

    let mut tokens = Vec::new();
    loop {
        match client.try_acquire() {
            Slot::Explicit(byte) => tokens.push(byte),
            Slot::Invalid => break,
            Slot::Implicit => panic!("second implicit slot"),
        }
    }
    assert_eq!(tokens.len(), 3);

    // Handing everything back refills the pool exactly.
    for byte in tokens {
        client.release(Slot::Explicit(byte));
    }
    client.release(Slot::Implicit);
    assert_eq!(pool.available().unwrap(), 3);
    assert_eq!(client.try_acquire(), Slot::Implicit);
}

#[test]
fn invalid_release_is_a_no_op() {
    let pool = Pool::new(2).unwrap();
    let config = parse_makeflags(pool.env_fragment()).unwrap();
    let mut client = unsafe { Client::from_config(&config) }.unwrap().unwrap();
    client.release(Slot::Invalid);
    assert_eq!(pool.available().unwrap(), 1);
}

#[test]
fn none_config_means_no_client() {
    assert!(unsafe { Client::from_config(&JobserverConfig::None) }
        .unwrap()
        .is_none());
}

#[cfg(unix)]
mod unix {
    use std::fs;
    use std::io::Write;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use super::*;

    #[test]
    fn fifo_pool_advertises_its_path_and_cleans_up() {
        let pool = Pool::new_with_fifo(3).unwrap();
        assert_eq!(pool.available().unwrap(), 2);

        let fragment = pool.env_fragment().to_string();
        assert!(fragment.starts_with(" -j3 --jobserver-auth=fifo:"));
        let path = fragment.rsplit("fifo:").next().unwrap().to_string();
        assert!(Path::new(&path).exists());

        drop(pool);
        assert!(!Path::new(&path).exists());
    }

    #[test]
    fn fifo_round_trip() {
        let pool = Pool::new_with_fifo(4).unwrap();
        let config = parse_makeflags(pool.env_fragment()).unwrap();
        assert!(matches!(config, JobserverConfig::Fifo(_)));
        let mut client = unsafe { Client::from_config(&config) }.unwrap().unwrap();

        assert_eq!(client.try_acquire(), Slot::Implicit);
        let mut drained = 0;
        while let Slot::Explicit(byte) = client.try_acquire() {
            client.release(Slot::Explicit(byte));
            drained += 1;
            if drained == 3 {
                break;
            }
        }
        assert_eq!(drained, 3);
    }

    #[test]
    fn fifo_client_drains_an_externally_seeded_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");
        let cpath = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) }, 0);

        let mut fifo = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        fifo.write_all(b"01234").unwrap();

        let config = JobserverConfig::Fifo(path.to_str().unwrap().to_string());
        let mut client = unsafe { Client::from_config(&config) }.unwrap().unwrap();

        assert_eq!(client.try_acquire(), Slot::Implicit);
        for expected in b"01234" {
            assert_eq!(client.try_acquire(), Slot::Explicit(*expected));
        }
        assert_eq!(client.try_acquire(), Slot::Invalid);
    }

    #[test]
    fn fifo_client_rejects_a_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-fifo");
        fs::write(&path, b"++").unwrap();

        let config = JobserverConfig::Fifo(path.to_str().unwrap().to_string());
        let err = unsafe { Client::from_config(&config) }.unwrap_err();
        assert!(matches!(err, Error::EndpointSetup { .. }));
    }

    #[test]
    fn descriptor_client_rejects_non_pipes() {
        // Integers that do not name open descriptors at all.
        let config = JobserverConfig::FileDescriptors {
            read: 980,
            write: 981,
        };
        let err = unsafe { Client::from_config(&config) }.unwrap_err();
        assert!(matches!(err, Error::EndpointSetup { .. }));
    }

    #[test]
    fn semaphore_config_is_unsupported_here() {
        let config = JobserverConfig::Win32Semaphore("gmake_sem".to_string());
        let err = unsafe { Client::from_config(&config) }.unwrap_err();
        assert!(matches!(err, Error::UnsupportedMode(_)));
    }
}
