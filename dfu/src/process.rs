use crate::error::DfuError;
use crate::session::DfuSession;
use crate::state::DfuStatus;
use crate::transport::Transport;

/// Progress of a [ReadProcess].
#[derive(Debug)]
pub enum ReadEvent<'a> {
    /// `done` bytes received so far, out of `total` when the size is known.
    Process { done: usize, total: Option<usize> },
    Error(&'a DfuError),
    End(&'a [u8]),
}

/// Progress of a [WriteProcess].
#[derive(Debug)]
pub enum WriteEvent<'a> {
    EraseStart,
    EraseProcess {
        bytes_sent: usize,
        expected_size: usize,
    },
    EraseEnd,
    WriteStart,
    WriteProcess {
        bytes_sent: usize,
        expected_size: usize,
    },
    WriteEnd {
        bytes_sent: usize,
    },
    /// Last status reported by the device after manifestation.
    Verify(DfuStatus),
    Error(&'a DfuError),
    End,
}

/// Session lifecycle notifications.
#[derive(Debug)]
pub enum SessionEvent<'a> {
    Init,
    Connect,
    /// The device is gone. Carries the error that revealed it, if any.
    Disconnect(Option<&'a DfuError>),
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TransferOptions {
    pub(crate) transfer_size: Option<u16>,
    pub(crate) manifestation_tolerant: Option<bool>,
}

/// A pending firmware upload (device to host).
///
/// Obtained from [DfuSession::read] and consumed by [ReadProcess::run].
#[must_use = "a read process does nothing until run"]
pub struct ReadProcess<'s, T: Transport> {
    session: &'s mut DfuSession<T>,
    max_size: Option<usize>,
    options: TransferOptions,
}

impl<'s, T: Transport> ReadProcess<'s, T> {
    pub(crate) fn new(
        session: &'s mut DfuSession<T>,
        max_size: Option<usize>,
    ) -> Self {
        ReadProcess {
            session,
            max_size,
            options: TransferOptions::default(),
        }
    }

    /// Override the negotiated `wTransferSize`.
    pub fn transfer_size(mut self, transfer_size: u16) -> Self {
        self.options.transfer_size = Some(transfer_size.max(1));
        self
    }

    /// Run the upload to completion. `on_event` sees every progress event
    /// followed by exactly one [ReadEvent::End] or [ReadEvent::Error].
    pub fn run(
        self,
        mut on_event: impl FnMut(ReadEvent<'_>),
    ) -> Result<Vec<u8>, DfuError> {
        match self
            .session
            .run_read(self.max_size, self.options, &mut on_event)
        {
            Ok(data) => {
                on_event(ReadEvent::End(&data));
                Ok(data)
            }
            Err(err) => {
                on_event(ReadEvent::Error(&err));
                Err(err)
            }
        }
    }
}

/// A pending firmware download (host to device).
///
/// Obtained from [DfuSession::write] and consumed by [WriteProcess::run].
#[must_use = "a write process does nothing until run"]
pub struct WriteProcess<'s, 'd, T: Transport> {
    session: &'s mut DfuSession<T>,
    data: &'d [u8],
    options: TransferOptions,
}

impl<'s, 'd, T: Transport> WriteProcess<'s, 'd, T> {
    pub(crate) fn new(session: &'s mut DfuSession<T>, data: &'d [u8]) -> Self {
        WriteProcess {
            session,
            data,
            options: TransferOptions::default(),
        }
    }

    /// Override the negotiated `wTransferSize`.
    pub fn transfer_size(mut self, transfer_size: u16) -> Self {
        self.options.transfer_size = Some(transfer_size.max(1));
        self
    }

    /// Override `bitManifestationTolerant` from the functional descriptor.
    pub fn manifestation_tolerant(mut self, tolerant: bool) -> Self {
        self.options.manifestation_tolerant = Some(tolerant);
        self
    }

    /// Run the download to completion. The last event passed to `on_event`
    /// is exactly one [WriteEvent::End] or [WriteEvent::Error].
    pub fn run(
        self,
        mut on_event: impl FnMut(WriteEvent<'_>),
    ) -> Result<(), DfuError> {
        match self.session.run_write(self.data, self.options, &mut on_event) {
            Ok(()) => {
                on_event(WriteEvent::End);
                Ok(())
            }
            Err(err) => {
                on_event(WriteEvent::Error(&err));
                Err(err)
            }
        }
    }
}
