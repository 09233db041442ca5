use headunit_lifecycle::AppId;

use crate::registry::Registry;

/// Ids whose recorded state claims a live process that is not actually
/// running. Exits already seen by the monitor are left to their event.
/// Pure inspection: the caller applies the transition, and nothing here
/// spawns or signals.
pub(crate) fn sweep(registry: &Registry) -> Vec<AppId> {
    registry
        .iter()
        .filter(|r| r.state.is_live())
        .filter(|r| match &r.process {
            Some(p) => !p.is_running() && !p.exit_pending(),
            None => true,
        })
        .map(|r| r.id)
        .collect()
}
