use super::poller::{MAX_EVENTS, Poller};
use super::registry::{Registration, Registry};
use super::signal::{self, SignalPipe};
use super::timerfd::{TimerFds, TimerRead};
use super::{Command, Inbox, ManagerToken};
use crate::object::{ObjRef, ObjectId};
use crate::source::{ProcessEvents, SourceInner, SourceType};
use crate::time::ClockKind;
use crate::timer::{Tier, TimerEntry, TimerHeap};
use nix::sys::signal::Signal;
use smallvec::{SmallVec, smallvec};
use std::collections::HashMap;
use std::io;
use std::ops::ControlFlow;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How often descriptors epoll refused are polled while armed.
const FALLBACK_POLL_INTERVAL_MS: i32 = 10;

/// Pause after `epoll_wait` itself failed.
const WAIT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
enum Ready {
    Wake,
    Signals,
    Timer(ClockKind, Tier),
    Fd,
    Process,
}

/// Sources watching one signal, with the delivery count each has seen.
#[derive(Debug, Default)]
struct SignalWatch {
    sources: Vec<(ObjRef<SourceInner>, u64)>,
}

/// State owned by the manager thread.
pub(super) struct EventLoop {
    inbox: Arc<Inbox>,
    registry: Registry,
    events: Vec<libc::epoll_event>,

    timers: TimerHeap,
    timer_fds: TimerFds,
    /// Installed timer sources.
    timer_sources: HashMap<ObjectId, ObjRef<SourceInner>>,

    signal_pipe: SignalPipe,
    signals: HashMap<Signal, SignalWatch>,
}

impl EventLoop {
    pub(super) fn new(inbox: Arc<Inbox>) -> io::Result<Self> {
        let mut registry = Registry::new(Poller::new()?);
        let timer_fds = TimerFds::new()?;
        let signal_pipe = SignalPipe::new()?;

        registry.register(inbox.wake.as_raw_fd(), Registration::Wake)?;
        registry.register(signal_pipe.read_fd(), Registration::Signals)?;
        for (clock, tier, fd) in timer_fds.iter() {
            registry.register(fd, Registration::Timer(clock, tier))?;
        }

        Ok(Self {
            inbox,
            registry,
            events: Vec::with_capacity(MAX_EVENTS),
            timers: TimerHeap::new(),
            timer_fds,
            timer_sources: HashMap::new(),
            signal_pipe,
            signals: HashMap::new(),
        })
    }

    pub(super) fn run(mut self) {
        let token = ManagerToken::new();
        tracing::debug!("manager thread started");

        loop {
            if self.process_commands(&token).is_break() {
                break;
            }

            self.program_timers();

            let timeout = if self.registry.poll_fallback(&token) {
                FALLBACK_POLL_INTERVAL_MS
            } else {
                -1
            };

            if let Err(e) = self.registry.poller().wait(&mut self.events, timeout) {
                warn_once!(error = %e, "epoll_wait failed");
                thread::sleep(WAIT_ERROR_BACKOFF);
                continue;
            }

            for i in 0..self.events.len() {
                let ev = self.events[i];
                let (key, flags) = (ev.u64 as usize, ev.events);
                self.dispatch(key, flags, &token);
            }
        }

        let dropped = std::iter::from_fn(|| self.inbox.commands.pop()).count();
        tracing::debug!(
            dropped,
            timers = self.timer_sources.len(),
            "manager thread stopped"
        );
    }

    fn process_commands(&mut self, token: &ManagerToken) -> ControlFlow<()> {
        while let Some(command) = self.inbox.commands.pop() {
            tracing::trace!(?command, "manager command");

            match command {
                Command::Install(source) => self.install(&source, token),
                Command::Rearm(source) => self.rearm(&source, token),
                Command::Cancel(source) => self.uninstall(&source, token),
                Command::ConfigureTimer(source) => self.configure_timer(&source),
                Command::DisarmTimer(source) => {
                    self.timers.disarm(source.id());
                }
                Command::ResumeTimer(source) => {
                    if !source.is_canceled() {
                        self.timers.resume(source.id());
                    }
                }
                Command::Shutdown => return ControlFlow::Break(()),
            }
        }

        ControlFlow::Continue(())
    }

    fn install(&mut self, source: &ObjRef<SourceInner>, token: &ManagerToken) {
        // Its Cancel command is queued behind.
        if source.is_canceled() {
            return;
        }

        match source.kind() {
            SourceType::Read | SourceType::Write => self.registry.install_fd(source, token),
            SourceType::Signal => self.install_signal(source),
            SourceType::Process => self.install_process(source),
            SourceType::Timer => {
                self.timer_sources.insert(source.id(), source.clone());
                self.configure_timer(source);
            }
            SourceType::DataAdd | SourceType::DataOr | SourceType::DataReplace => {}
        }

        SourceInner::installed(source, token);
    }

    fn rearm(&mut self, source: &ObjRef<SourceInner>, token: &ManagerToken) {
        if source.is_canceled() || !source.is_installed() {
            return;
        }
        self.registry.rearm_fd(source, token);
    }

    fn uninstall(&mut self, source: &ObjRef<SourceInner>, token: &ManagerToken) {
        if source.is_installed() {
            match source.kind() {
                SourceType::Read | SourceType::Write => self.registry.uninstall_fd(source, token),
                SourceType::Signal => {
                    if let Some(watch) = Signal::try_from(source.ident() as i32)
                        .ok()
                        .and_then(|signal| self.signals.get_mut(&signal))
                    {
                        watch.sources.retain(|(s, _)| !s.ptr_eq(source));
                    }
                }
                SourceType::Process => {
                    self.registry.remove_process(source.id());
                }
                SourceType::Timer => {
                    self.timers.remove(source.id());
                    self.timer_sources.remove(&source.id());
                }
                SourceType::DataAdd | SourceType::DataOr | SourceType::DataReplace => {}
            }
        }

        SourceInner::uninstalled(source, token);
    }

    fn install_signal(&mut self, source: &ObjRef<SourceInner>) {
        let Ok(signal) = Signal::try_from(source.ident() as i32) else {
            unreachable!("signal source with unchecked signal number");
        };

        if !self.signal_pipe.attach() {
            warn_once!(?signal, "too many runtimes watching signals, source stays silent");
            return;
        }

        if let Err(e) = signal::install_handler(signal) {
            warn_once!(?signal, error = %e, "failed to install signal handler");
            return;
        }

        self.signals
            .entry(signal)
            .or_default()
            .sources
            .push((source.clone(), signal::count(signal)));
    }

    fn dispatch_signals(&mut self) {
        self.signal_pipe.drain();

        for (signal, watch) in &mut self.signals {
            let count = signal::count(*signal);
            for (source, seen) in &mut watch.sources {
                let delta = count.wrapping_sub(*seen);
                if delta > 0 {
                    *seen = count;
                    SourceInner::latch(source, delta);
                }
            }
        }
    }

    fn install_process(&mut self, source: &ObjRef<SourceInner>) {
        let pid = source.ident() as libc::pid_t;
        let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                // Gone already. Delivered once the source is installed.
                SourceInner::latch(source, ProcessEvents::EXIT.bits());
            } else {
                warn_once!(pid, error = %err, "failed to open pidfd, source stays silent");
            }
            return;
        }

        // Safety: pidfd_open returned a new descriptor.
        let pidfd = unsafe { OwnedFd::from_raw_fd(ret as libc::c_int) };
        if let Err(e) = self.registry.install_process(source, pidfd) {
            warn_once!(pid, error = %e, "failed to watch pidfd, source stays silent");
        }
    }

    fn dispatch_process(&mut self, key: usize) {
        let id = match self.registry.get(key) {
            Some(Registration::Process { source, .. }) => source.id(),
            _ => return,
        };

        if let Some(source) = self.registry.remove_process(id) {
            SourceInner::latch(&source, ProcessEvents::EXIT.bits());
        }
    }

    /// Arms the timer of an installed source from its current spec.
    fn configure_timer(&mut self, source: &ObjRef<SourceInner>) {
        let id = source.id();
        if !self.timer_sources.contains_key(&id) {
            return;
        }

        let entry = source
            .timer_spec()
            .and_then(|spec| TimerEntry::new(id, &spec, source.timer_tier(), source.is_strict()));

        match entry {
            Some(entry) => {
                self.timers.arm(entry);
                if source.is_suspended() {
                    self.timers.disarm(id);
                }
            }
            None => {
                self.timers.remove(id);
            }
        }
    }

    fn program_timers(&mut self) {
        for (clock, tier) in self.timers.take_dirty() {
            let at = self.timers.wake_time(clock, tier);
            if let Err(e) = self.timer_fds.program(clock, tier, at) {
                warn_once!(?clock, ?tier, error = %e, "failed to program timerfd");
            }
        }
    }

    fn dispatch_timer(&mut self, clock: ClockKind, tier: Tier) {
        let read = self.timer_fds.read(clock, tier);
        self.fire_timers(clock, tier, read);
    }

    /// Fires what is due after the timerfd of `tier` went off. A changed wall
    /// clock moves every wall timer, so all tiers are checked then.
    fn fire_timers(&mut self, clock: ClockKind, tier: Tier, read: io::Result<TimerRead>) {
        let tiers: SmallVec<[Tier; 3]> = match read {
            Ok(TimerRead::ClockChanged) => {
                tracing::debug!("wall clock changed, reprogramming wall timers");
                self.timers.invalidate(ClockKind::Wall);
                Tier::ALL.into_iter().collect()
            }
            Ok(_) => smallvec![tier],
            Err(e) => {
                warn_once!(?clock, ?tier, error = %e, "failed to read timerfd");
                smallvec![tier]
            }
        };

        let now = clock.now();
        for tier in tiers {
            for fired in self.timers.fire_due(clock, tier, now) {
                if let Some(source) = self.timer_sources.get(&fired.id) {
                    SourceInner::latch(source, fired.fires);
                }
            }
        }
    }

    fn dispatch(&mut self, key: usize, flags: u32, token: &ManagerToken) {
        let ready = match self.registry.get(key) {
            Some(Registration::Wake) => Ready::Wake,
            Some(Registration::Signals) => Ready::Signals,
            Some(Registration::Timer(clock, tier)) => Ready::Timer(*clock, *tier),
            Some(Registration::Fd(_)) => Ready::Fd,
            Some(Registration::Process { .. }) => Ready::Process,
            // Removed earlier in this batch.
            None => return,
        };

        match ready {
            Ready::Wake => self.inbox.drain_wake(),
            Ready::Signals => self.dispatch_signals(),
            Ready::Timer(clock, tier) => self.dispatch_timer(clock, tier),
            Ready::Fd => self.registry.dispatch_fd(key, flags, token),
            Ready::Process => self.dispatch_process(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::DispatchTime;
    use crate::timer::TimerSpec;

    #[test]
    fn test_event_loop_owns_its_descriptors() -> anyhow::Result<()> {
        let inbox = Arc::new(Inbox::new()?);
        let event_loop = EventLoop::new(Arc::clone(&inbox))?;

        // Wake, signals and six timers.
        let registered = (0..16).filter(|&k| event_loop.registry.get(k).is_some()).count();
        assert_eq!(registered, 8);
        Ok(())
    }

    #[test]
    fn test_shutdown_command_stops_the_loop() -> anyhow::Result<()> {
        let inbox = Arc::new(Inbox::new()?);
        let event_loop = EventLoop::new(Arc::clone(&inbox))?;

        inbox.commands.push(Command::Shutdown);
        inbox.wake();

        let handle = thread::spawn(move || event_loop.run());
        handle.join().map_err(|_| anyhow::anyhow!("manager loop panicked"))?;
        Ok(())
    }

    #[rstest::rstest]
    #[case::clock_changed(TimerRead::ClockChanged, 3)]
    #[case::expired(TimerRead::Expired, 1)]
    fn test_wall_timers_after_timerfd_read(
        #[case] read: TimerRead,
        #[case] expected_fired: usize,
    ) -> anyhow::Result<()> {
        let inbox = Arc::new(Inbox::new()?);
        let mut event_loop = EventLoop::new(Arc::clone(&inbox))?;

        let past = ClockKind::Wall.now().saturating_sub(1_000_000);
        let ids = Tier::ALL
            .into_iter()
            .map(|tier| {
                let spec = TimerSpec {
                    start: DispatchTime::Wall(past),
                    interval: None,
                    leeway: Duration::ZERO,
                };
                let entry = TimerEntry::new(ObjectId::next(), &spec, tier, false)
                    .expect("wall timer in the past resolves");
                let id = entry.id;
                event_loop.timers.arm(entry);
                id
            })
            .collect::<Vec<_>>();

        event_loop.fire_timers(ClockKind::Wall, Tier::Normal, Ok(read));

        let fired = ids.iter().filter(|&&id| !event_loop.timers.is_armed(id)).count();
        assert_eq!(fired, expected_fired);
        Ok(())
    }
}
