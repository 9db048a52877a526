//! Net value of the managed position.
//!
//! The local estimate is a pure function of the snapshot. The authoritative
//! value comes from the ledger after a refresh round trip and is only trusted
//! for the cycle that requested it.

use comet_keeper_core::{
    ActionRequest, LedgerReader, LedgerSubmitter, RefreshNetValueRequest, Result, Revision,
};
use rust_decimal::Decimal;

use crate::batch::BatchBuilder;
use crate::state_cache::Snapshot;

/// Net value confirmed by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetValue {
    pub value: Decimal,
    pub revision: Revision,
    /// Local estimate taken before the refresh.
    pub estimate: Decimal,
}

/// Collateral held by the position and the manager, less impermanent-loss
/// debt at current prices and unclaimed fees. Committed liquidity nets out
/// against the credit minted to provide it, so only its debt counts.
///
/// # Errors
/// Fails if a held pool or its oracle is missing from the snapshot.
pub fn estimate_net_value(snapshot: &Snapshot) -> Result<Decimal> {
    let mut ild = Decimal::ZERO;
    for entry in &snapshot.position.entries {
        ild += entry.ild_value(snapshot.price(entry.pool_index)?);
    }
    Ok(snapshot.position.collateral + snapshot.manager.collateral_balance
        - ild
        - snapshot.manager.fees_accrued)
}

/// Whether `estimate` is further than `tolerance` (a fraction) from `value`.
#[must_use]
pub fn diverges(value: Decimal, estimate: Decimal, tolerance: Decimal) -> bool {
    let scale = value.abs().max(Decimal::ONE);
    (value - estimate).abs() / scale > tolerance
}

/// Asks the ledger to recompute and persist net value, then reads it back.
///
/// # Errors
/// Propagates batch assembly, submission and read failures.
pub async fn refresh_net_value<L>(
    ledger: &L,
    batches: &BatchBuilder,
    snapshot: &Snapshot,
    tolerance: Decimal,
) -> Result<NetValue>
where
    L: LedgerReader + LedgerSubmitter + ?Sized,
{
    let estimate = estimate_net_value(snapshot)?;
    let refresh = ActionRequest::RefreshNetValue(RefreshNetValueRequest {
        pool_indices: snapshot.held_pools(),
    });
    let batch = batches.build(vec![refresh], snapshot)?;
    let receipt = ledger.submit(&batch).await?;
    let manager = ledger.manager_state().await?;

    let value = manager.value.net_value;
    if diverges(value, estimate, tolerance) {
        tracing::warn!(
            ledger_value = %value,
            local_estimate = %estimate,
            %tolerance,
            "Net value diverges from local estimate"
        );
    }
    tracing::debug!(
        net_value = %value,
        revision = manager.value.net_value_revision,
        submitted_at = receipt.revision,
        "Net value refreshed"
    );
    Ok(NetValue {
        value,
        revision: manager.value.net_value_revision,
        estimate,
    })
}
