use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::{flag, low_level, SigId};

/// Turns SIGINT/SIGTERM into a flag the accept loop polls. Handlers are
/// removed again on drop.
pub struct ShutdownHooks {
    requested: Arc<AtomicBool>,
    #[cfg(unix)]
    registrations: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let requested = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        let registrations = [SIGINT, SIGTERM]
            .into_iter()
            .map(|signal| flag::register(signal, Arc::clone(&requested)))
            .collect::<io::Result<Vec<SigId>>>()?;

        Ok(Self {
            requested,
            #[cfg(unix)]
            registrations,
        })
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.registrations.drain(..) {
            low_level::unregister(id);
        }
    }
}
