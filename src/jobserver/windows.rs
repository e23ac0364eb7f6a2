use std::convert::TryInto;
use std::ffi::CString;
use std::fmt::Write as _;
use std::io;
use std::mem::MaybeUninit;
use std::os::windows::io::{AsRawHandle, HandleOrNull, OwnedHandle};
use std::ptr;

use getrandom::getrandom;
use log::{debug, warn};
use windows_sys::Win32::{
    Foundation::{FALSE, ERROR_ALREADY_EXISTS, WAIT_ABANDONED, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT},
    System::{
        Threading::{
            CreateSemaphoreA, ReleaseSemaphore, WaitForSingleObject, SEMAPHORE_MODIFY_STATE,
            THREAD_SYNCHRONIZE as SYNCHRONIZE,
        },
        WindowsProgramming::OpenSemaphoreA,
    },
};

use crate::error::{Error, Result};

type LONG = i32;

/// The byte reported for each acquired semaphore count. Semaphores
/// carry no payload, so every explicit slot uses the conventional
/// token value.
const TOKEN: u8 = b'+';

#[derive(Debug)]
pub(super) struct Client {
    sem: OwnedHandle,
}

impl Client {
    /// `--jobserver-auth=NAME`
    pub(super) fn open(name: &str) -> Result<Client> {
        let cname = CString::new(name).map_err(|_| {
            Error::endpoint(
                format!("jobserver semaphore `{}`", name),
                io::Error::from(io::ErrorKind::InvalidInput),
            )
        })?;
        let handle: io::Result<OwnedHandle> = unsafe {
            HandleOrNull::from_raw_handle(OpenSemaphoreA(
                SYNCHRONIZE | SEMAPHORE_MODIFY_STATE,
                FALSE,
                cname.as_ptr() as *const u8,
            ) as _)
        }
        .try_into()
        .map_err(|_| io::Error::last_os_error());

        let sem = handle.map_err(|e| Error::endpoint(format!("jobserver semaphore `{}`", name), e))?;
        debug!("jobserver client attached to semaphore {}", name);
        Ok(Client { sem })
    }

    /// A zero-timeout wait: either a count is available now or the
    /// caller goes back to supervising subprocesses.
    pub(super) fn try_acquire(&self) -> Option<u8> {
        match wait_zero(&self.sem) {
            Ok(true) => Some(TOKEN),
            Ok(false) => None,
            Err(e) => {
                warn!("jobserver semaphore wait failed: {}", e);
                None
            }
        }
    }

    pub(super) fn release(&self, _byte: u8) {
        if let Err(e) = release_one(&self.sem, None) {
            warn!("jobserver semaphore release failed: {}", e);
        }
    }

    pub(super) fn available(&self) -> io::Result<usize> {
        available(&self.sem)
    }
}

#[derive(Debug)]
pub(super) struct Pool {
    sem: OwnedHandle,
    env_fragment: String,
    slots: usize,
}

impl Pool {
    pub(super) fn new_semaphore(slots: usize) -> Result<Pool> {
        // One slot stays implicit with the owner; the semaphore only
        // carries the explicit tokens.
        let tokens: LONG = (slots - 1)
            .try_into()
            .map_err(|_| Error::InvalidSlotCount(slots))?;

        // Primarily <prefix><pid>; collisions (a recycled pid, or a
        // stale semaphore) retry with a random suffix.
        let prefix = "jobcrew_pool_";
        let mut name = format!("{}{}", prefix, std::process::id());

        for _ in 0..100 {
            let cname = CString::new(name.as_str()).unwrap();
            let res: io::Result<OwnedHandle> = unsafe {
                HandleOrNull::from_raw_handle(CreateSemaphoreA(
                    ptr::null_mut(),
                    tokens,
                    tokens,
                    cname.as_ptr() as *const u8,
                ) as _)
            }
            .try_into()
            .map_err(|_| io::Error::last_os_error());

            match res {
                Ok(sem) => {
                    if unsafe { windows_sys::Win32::Foundation::GetLastError() }
                        == ERROR_ALREADY_EXISTS
                    {
                        name = random_name(prefix)
                            .map_err(|e| Error::endpoint("jobserver semaphore name", e))?;
                        continue;
                    }
                    let env_fragment = format!(" -j{} --jobserver-auth={}", slots, name);
                    debug!("created {}-slot semaphore jobserver pool `{}`", slots, name);
                    return Ok(Pool {
                        sem,
                        env_fragment,
                        slots,
                    });
                }
                Err(err) => {
                    if err.raw_os_error() == Some(ERROR_ALREADY_EXISTS as i32) {
                        name = random_name(prefix)
                            .map_err(|e| Error::endpoint("jobserver semaphore name", e))?;
                    } else {
                        return Err(Error::endpoint("jobserver semaphore", err));
                    }
                }
            }
        }

        Err(Error::endpoint(
            "jobserver semaphore",
            io::Error::new(
                io::ErrorKind::Other,
                "failed to find a unique name for a semaphore",
            ),
        ))
    }

    pub(super) fn env_fragment(&self) -> &str {
        &self.env_fragment
    }

    pub(super) fn slots(&self) -> usize {
        self.slots
    }

    pub(super) fn available(&self) -> io::Result<usize> {
        available(&self.sem)
    }
}

fn random_name(prefix: &str) -> io::Result<String> {
    let mut bytes = [0u8; 16];
    getrandom(&mut bytes)?;
    let mut name = String::with_capacity(prefix.len() + 32);
    name.push_str(prefix);
    write!(&mut name, "{:x}", u128::from_ne_bytes(bytes)).unwrap();
    Ok(name)
}

fn wait_zero(sem: &OwnedHandle) -> io::Result<bool> {
    match unsafe { WaitForSingleObject(sem.as_raw_handle() as _, 0) } {
        WAIT_OBJECT_0 => Ok(true),
        WAIT_TIMEOUT => Ok(false),
        WAIT_FAILED => Err(io::Error::last_os_error()),
        WAIT_ABANDONED => Err(io::Error::new(
            io::ErrorKind::Other,
            "wait on jobserver semaphore returned WAIT_ABANDONED",
        )),
        ret => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("unexpected WaitForSingleObject return {:#x}", ret),
        )),
    }
}

fn release_one(sem: &OwnedHandle, prev_count: Option<&mut MaybeUninit<LONG>>) -> io::Result<()> {
    let r = unsafe {
        ReleaseSemaphore(
            sem.as_raw_handle() as _,
            1,
            prev_count
                .map(MaybeUninit::as_mut_ptr)
                .unwrap_or_else(ptr::null_mut),
        )
    };
    if r != 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// A semaphore's count cannot be read directly; acquire one count
/// without sleeping and learn the previous value on release.
fn available(sem: &OwnedHandle) -> io::Result<usize> {
    if wait_zero(sem)? {
        let mut prev = MaybeUninit::uninit();
        release_one(sem, Some(&mut prev))?;
        let prev: usize = unsafe { prev.assume_init() }.try_into().unwrap();
        Ok(prev + 1)
    } else {
        Ok(0)
    }
}
