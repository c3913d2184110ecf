use tracing::info;

use crate::error::{Error, Result};

/// Pins the calling thread to `cpu`. Both engines run on a single thread,
/// so pinning it keeps wake-ups on one core.
pub fn pin_current_thread(cpu: usize) -> Result<()> {
    let core = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|core| core.id == cpu)
        .ok_or(Error::Affinity(cpu))?;

    if !core_affinity::set_for_current(core) {
        return Err(Error::Affinity(cpu));
    }
    info!("Pinned engine thread to CPU core {}", cpu);
    Ok(())
}
