use footprint::identity::{ControllerSettings, IdentityBackend, IdentityController};
use futures::future::join_all;

/// Connects every slot concurrently and returns the ones that came up, in
/// slot order. Slots that exhaust their rotation ceiling are logged and left
/// out.
pub async fn healthy_slots<B>(backend: &B, workers: u16, settings: ControllerSettings) -> Vec<u16>
where
    B: IdentityBackend + Clone,
{
    let checks = (0..workers).map(|slot| {
        let mut controller = IdentityController::new(slot, backend.clone(), settings);
        async move {
            let result = controller.connect().await.map(|_| ());
            (slot, result)
        }
    });

    join_all(checks)
        .await
        .into_iter()
        .filter_map(|(slot, result)| match result {
            Ok(()) => Some(slot),
            Err(e) => {
                tracing::warn!(slot, error = %e, "Slot failed preflight; no shard will be assigned");
                None
            }
        })
        .collect()
}
