use bitflags::bitflags;

bitflags! {
    /// Lifecycle of a source. Bits are only ever set, except `ARMED` and
    /// `DELIVERY_PENDING`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct SourceState: u32 {
        /// `activate` was called. Installation was requested unless the
        /// source was already canceled.
        const ACTIVATED = 1;

        /// The manager registered the source with the kernel.
        const INSTALLED = 1 << 1;

        /// The kernel registration will report the next event. Cleared when a
        /// oneshot registration fires, set again on rearm.
        const ARMED = 1 << 2;

        /// A delivery is queued on the private queue.
        const DELIVERY_PENDING = 1 << 3;

        const CANCELED = 1 << 4;

        /// The manager tore the kernel registration down after cancellation.
        const UNINSTALLED = 1 << 5;
    }
}
