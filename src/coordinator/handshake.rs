//! Secure-aggregation handshake: tester selection and the key fan-out that
//! follows a fully confirmed liveness check.

use std::collections::HashMap;

use rand::seq::SliceRandom;

use crate::message::{ClientHandle, DataSpread, PublicKey};

use super::registry::ParticipantRegistry;

/// Mock weighting value forwarded with the spread; the real value belongs to
/// the external aggregation layer.
const WEIGHTING: f64 = 0.5;

/// Tester-set size for `n` participants: `ceil(0.3 * n)`.
pub fn tester_quota(n: usize) -> usize {
    (n as f64 * 0.3).ceil() as usize
}

/// Pick the per-round tester subset. Computed once per round, after liveness
/// confirmed everyone alive; immutable thereafter.
pub fn select_testers(registry: &ParticipantRegistry) -> Vec<String> {
    let mut ids: Vec<String> = registry.ids().cloned().collect();
    ids.shuffle(&mut rand::thread_rng());
    ids.truncate(tester_quota(registry.len()));
    ids
}

/// Build the `DataSpread` fan-out for every non-tester: the key map carries
/// the non-tester participants only, so testers never appear in the training
/// key distribution set.
pub fn spread_messages(
    registry: &ParticipantRegistry,
    testers: &[String],
    secure_agg: bool,
    dp_threshold: f64,
) -> Vec<(ClientHandle, DataSpread)> {
    let public_keys: HashMap<String, PublicKey> = registry
        .iter()
        .filter(|p| !testers.contains(&p.client_id))
        .filter_map(|p| {
            p.public_key
                .clone()
                .map(|key| (p.client_id.clone(), key))
        })
        .collect();
    let trainer_count = registry.len() - testers.len();

    registry
        .iter()
        .filter(|p| !testers.contains(&p.client_id))
        .map(|p| {
            (
                p.handle.clone(),
                DataSpread {
                    trainer_count,
                    public_keys: public_keys.clone(),
                    secure_agg,
                    dp_threshold,
                    weighting: WEIGHTING,
                },
            )
        })
        .collect()
}
