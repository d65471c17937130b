//! Adaptive modulation and coding.
//!
//! PER is tracked per send window by two EMAs whose windows are measured in
//! packets at the current MCS, so the estimators react in (roughly)
//! constant airtime regardless of how many packets fit in a slot. A
//! down-shift is driven by the short window crossing the high-PER
//! threshold; an up-shift requires the long window to stay under the
//! low-PER threshold and then passes either an EVM gate or a probabilistic
//! gate whose odds decay every time the level proves unsustainable.

use rand::Rng;
use tracing::{debug, info};

use crate::arq::send_window::SendWindow;
use crate::neighbor::Neighbor;
use crate::phy::McsTable;

/// AMC policy parameters.
#[derive(Debug, Clone)]
pub struct AmcParams {
    /// Lowest MCS index the policy may select.
    pub mcsidx_min: usize,
    /// Highest MCS index the policy may select.
    pub mcsidx_max: usize,
    /// Long-PER threshold below which an up-shift is considered.
    pub up_per_threshold: f64,
    /// Short-PER threshold above which a down-shift is taken.
    pub down_per_threshold: f64,
    /// Multiplicative decay applied to a level's transition probability on
    /// down-shift.
    pub alpha: f64,
    /// Floor for transition probabilities.
    pub prob_floor: f64,
    /// Short PER window, in slots' worth of packets.
    pub short_per_nslots: u64,
    /// Long PER window, in slots' worth of packets.
    pub long_per_nslots: u64,
}

/// Score one successful transmission.
pub fn tx_success(sendw: &mut SendWindow) {
    sendw.short_per.update(0.0);
    sendw.long_per.update(0.0);
}

/// Score one failed transmission.
pub fn tx_failure(sendw: &mut SendWindow) {
    sendw.short_per.update(1.0);
    sendw.long_per.update(1.0);
}

/// Resize and reset both PER estimators for the window's current MCS.
///
/// Window sizes are recomputed on every MCS change because the number of
/// packets per slot changes with the MCS.
pub fn reset_per_estimates(
    sendw: &mut SendWindow,
    table: &McsTable,
    params: &AmcParams,
    tx_slot_samps: usize,
) {
    let pps = table.packets_per_slot(sendw.mcsidx, tx_slot_samps).max(1) as u64;

    sendw.short_per.resize(params.short_per_nslots * pps, 0.0);
    sendw.long_per.resize(params.long_per_nslots * pps, 0.0);
}

/// Move the window to MCS `idx`, skipping invalid levels upward.
///
/// Resets the PER estimators, advances `per_end` past everything already
/// assigned, and publishes the new index to the neighbor record.
pub fn set_mcs(
    sendw: &mut SendWindow,
    neighbor: &mut Neighbor,
    table: &McsTable,
    params: &AmcParams,
    tx_slot_samps: usize,
    idx: usize,
) {
    let mut idx = idx;
    while idx + 1 < table.len() && !table.is_valid(idx, tx_slot_samps) {
        idx += 1;
    }

    sendw.mcsidx = idx;
    if neighbor.seq > sendw.per_end {
        sendw.per_end = neighbor.seq;
    }
    neighbor.mcsidx = idx;

    reset_per_estimates(sendw, table, params, tx_slot_samps);

    info!(
        "AMC: set modulation scheme: node={}; mcsidx={}; unack={}; per_end={}; swin={}; lwin={}",
        sendw.node,
        idx,
        sendw.unack,
        sendw.per_end,
        sendw.short_per.window(),
        sendw.long_per.window(),
    );
}

fn evm_permits_down(sendw: &SendWindow, table: &McsTable, idx: usize) -> bool {
    match table.entry(idx).evm_threshold {
        None => true,
        Some(threshold) => matches!(sendw.long_evm, Some(evm) if evm >= threshold),
    }
}

fn may_move_up<R: Rng>(
    sendw: &SendWindow,
    table: &McsTable,
    params: &AmcParams,
    tx_slot_samps: usize,
    rng: &mut R,
) -> bool {
    let top = params.mcsidx_max.min(table.len() - 1);
    if sendw.mcsidx >= top {
        return false;
    }

    let next = sendw.mcsidx + 1;
    if !table.is_valid(next, tx_slot_samps) {
        return false;
    }

    match table.entry(next).evm_threshold {
        Some(threshold) => matches!(sendw.long_evm, Some(evm) if evm < threshold),
        None => rng.gen::<f64>() < sendw.mcsidx_prob[next],
    }
}

/// Run the MCS transition decision after a feedback or retransmission
/// event.
pub fn update_mcs<R: Rng>(
    sendw: &mut SendWindow,
    neighbor: &mut Neighbor,
    table: &McsTable,
    params: &AmcParams,
    tx_slot_samps: usize,
    rng: &mut R,
) {
    let short_per = sendw.short_per.value();
    let long_per = sendw.long_per.value();

    debug!(
        "AMC: updateMCS: node={}; short_per={:.4} ({} samples); long_per={:.4} ({} samples)",
        sendw.node,
        short_per,
        sendw.short_per.nsamples(),
        long_per,
        sendw.long_per.nsamples(),
    );

    if sendw.short_per.full() && short_per > params.down_per_threshold {
        // The current level failed its PER test; make it harder to re-enter
        let cur = sendw.mcsidx;
        sendw.mcsidx_prob[cur] = (sendw.mcsidx_prob[cur] * params.alpha).max(params.prob_floor);

        info!(
            "AMC: transition probability: node={}; mcsidx={}; prob={:.4}",
            sendw.node, cur, sendw.mcsidx_prob[cur],
        );

        // Step down as far as the EVM feedback says the channel requires
        let mut n = 0;
        loop {
            let k = n + 1;
            if k > sendw.mcsidx {
                break;
            }
            let idx = sendw.mcsidx - k;
            if idx < params.mcsidx_min
                || !table.is_valid(idx, tx_slot_samps)
                || !evm_permits_down(sendw, table, idx)
            {
                break;
            }
            n = k;
        }

        if n >= 1 {
            let target = sendw.mcsidx - n;
            info!(
                "AMC: moving down modulation scheme: node={}; short_per={:.4}; levels={}",
                sendw.node, short_per, n,
            );
            set_mcs(sendw, neighbor, table, params, tx_slot_samps, target);
        } else {
            reset_per_estimates(sendw, table, params, tx_slot_samps);
        }
    } else if sendw.long_per.full() && long_per < params.up_per_threshold {
        // The current level passed its long PER test
        let cur = sendw.mcsidx;
        sendw.mcsidx_prob[cur] = 1.0;

        if may_move_up(sendw, table, params, tx_slot_samps, rng) {
            let target = sendw.mcsidx + 1;
            info!(
                "AMC: moving up modulation scheme: node={}; long_per={:.4}",
                sendw.node, long_per,
            );
            set_mcs(sendw, neighbor, table, params, tx_slot_samps, target);
        } else {
            reset_per_estimates(sendw, table, params, tx_slot_samps);
        }
    }
}
