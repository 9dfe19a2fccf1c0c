use crate::error::SourceError;
use bitflags::bitflags;
use nix::sys::signal::Signal;

/// What a source watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    /// A descriptor has data to read. Data is the number of bytes readable,
    /// or 0 at end of file.
    Read,
    /// A descriptor has buffer space to write.
    Write,
    /// A signal was delivered to the process. Data is the number of
    /// deliveries since the last handler run. The handle is the signal
    /// number.
    Signal,
    /// A process changed state. Data is a [`ProcessEvents`] mask. The handle
    /// is the pid.
    Process,
    /// Custom source, merged values are added.
    DataAdd,
    /// Custom source, merged values are or-ed.
    DataOr,
    /// Custom source, the latest merged value wins.
    DataReplace,
    /// Fires per [`Source::set_timer`](crate::Source::set_timer). Data is
    /// the number of fires since the last handler run.
    Timer,
}

/// How new data is combined with data not delivered yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Merge {
    Add,
    Or,
    Replace,
}

bitflags! {
    /// Events of a [`SourceType::Process`] source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProcessEvents: u64 {
        const EXIT = 0x8000_0000;
        const FORK = 0x4000_0000;
        const EXEC = 0x2000_0000;
        const SIGNAL = 0x0800_0000;
    }
}

bitflags! {
    /// Mask of a [`SourceType::Timer`] source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TimerFlags: u64 {
        /// Ignore the leeway, fire as close to the target as possible.
        const STRICT = 1;
    }
}

impl SourceType {
    pub(crate) fn merge(self) -> Merge {
        match self {
            SourceType::Read | SourceType::Write | SourceType::DataReplace => Merge::Replace,
            SourceType::Signal | SourceType::DataAdd | SourceType::Timer => Merge::Add,
            SourceType::Process | SourceType::DataOr => Merge::Or,
        }
    }

    pub(crate) fn is_custom(self) -> bool {
        matches!(
            self,
            SourceType::DataAdd | SourceType::DataOr | SourceType::DataReplace
        )
    }

    /// Descriptor sources are disarmed by the kernel when they fire and
    /// rearmed once the handler returned.
    pub(crate) fn rearms(self) -> bool {
        matches!(self, SourceType::Read | SourceType::Write)
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            SourceType::Read => "read",
            SourceType::Write => "write",
            SourceType::Signal => "signal",
            SourceType::Process => "process",
            SourceType::DataAdd => "data-add",
            SourceType::DataOr => "data-or",
            SourceType::DataReplace => "data-replace",
            SourceType::Timer => "timer",
        }
    }

    /// Checks `handle` and `mask` for this type.
    pub(crate) fn validate(self, handle: u64, mask: u64) -> Result<(), SourceError> {
        let invalid_handle = || SourceError::InvalidHandle { kind: self, handle };
        let invalid_mask = || SourceError::InvalidMask { kind: self, mask };

        match self {
            SourceType::Read | SourceType::Write => {
                let fd = i32::try_from(handle).map_err(|_| invalid_handle())?;
                // Safety: F_GETFD only queries the descriptor table.
                if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
                    return Err(invalid_handle());
                }
                if mask != 0 {
                    return Err(invalid_mask());
                }
            }
            SourceType::Signal => {
                let signo = i32::try_from(handle).map_err(|_| invalid_handle())?;
                // Realtime signals are not supported.
                match Signal::try_from(signo) {
                    Ok(Signal::SIGKILL | Signal::SIGSTOP) | Err(_) => {
                        return Err(invalid_handle());
                    }
                    Ok(_) => {}
                }
                if mask != 0 {
                    return Err(invalid_mask());
                }
            }
            SourceType::Process => {
                if handle == 0 || i32::try_from(handle).is_err() {
                    return Err(invalid_handle());
                }
                let events = ProcessEvents::from_bits(mask).ok_or_else(invalid_mask)?;
                if events.is_empty() {
                    return Err(invalid_mask());
                }
                // Only exits are observable through a pidfd.
                if events != ProcessEvents::EXIT {
                    return Err(SourceError::Unsupported {
                        kind: self,
                        op: "watching process events other than EXIT",
                    });
                }
            }
            SourceType::DataAdd | SourceType::DataOr | SourceType::DataReplace => {
                if handle != 0 {
                    return Err(invalid_handle());
                }
                if mask != 0 {
                    return Err(invalid_mask());
                }
            }
            SourceType::Timer => {
                if handle != 0 {
                    return Err(invalid_handle());
                }
                if TimerFlags::from_bits(mask).is_none() {
                    return Err(invalid_mask());
                }
            }
        }

        Ok(())
    }
}
