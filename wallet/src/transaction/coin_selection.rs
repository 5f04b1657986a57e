// Coin Selection
// Deterministic input selection with exact, size-derived fees

use bitcoin::{ScriptBuf, TxOut};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

use super::weight::{self, P2WPKH_INPUT_VBYTES};
use crate::utxo::{TargetValue, Utxo};

/// Search budget for branch and bound
const BNB_MAX_TRIES: usize = 100_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Insufficient funds: need {needed}, have {available} (short by {shortfall})")]
    InsufficientFunds {
        needed: u64,
        available: u64,
        shortfall: u64,
    },

    #[error("No targets specified")]
    NoTargets,

    #[error("At most one target may send the remaining balance, got {0}")]
    MultipleSendAll(usize),

    #[error("Fee rate must be at least 1 sat/vbyte")]
    InvalidFeeRate,

    #[error("Amount overflow")]
    Overflow,
}

impl SelectionError {
    fn insufficient(needed: u64, available: u64) -> Self {
        SelectionError::InsufficientFunds {
            needed,
            available,
            shortfall: needed.saturating_sub(available),
        }
    }
}

/// Coin selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinSelectionStrategy {
    /// Branch and Bound - look for a changeless match, else largest first
    BranchAndBound,
    /// Largest first - simple greedy algorithm
    LargestFirst,
    /// Smallest first - UTXO consolidation
    SmallestFirst,
}

/// Output to fund, with its script already validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionTarget {
    pub script_pubkey: ScriptBuf,
    pub value: TargetValue,
}

/// Result of a successful selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Chosen inputs, in transaction order
    pub inputs: Vec<Utxo>,
    /// Exact fee: inputs minus every output
    pub fee: u64,
    /// Change value, present only above the dust threshold
    pub change: Option<u64>,
    /// Resolved value of the send-all target, if any
    pub send_all_value: Option<u64>,
    /// Virtual size the fee was charged on
    pub vsize: u64,
}

impl Selection {
    pub fn total_in(&self) -> u64 {
        self.inputs.iter().map(|u| u.value).sum()
    }
}

/// Outcome of evaluating one candidate input set
struct Evaluation {
    fee: u64,
    change: Option<u64>,
    vsize: u64,
}

/// Pure, reentrant coin selector
#[derive(Debug, Clone)]
pub struct CoinSelector {
    strategy: CoinSelectionStrategy,
    dust_threshold: u64,
}

impl CoinSelector {
    pub fn new(strategy: CoinSelectionStrategy, dust_threshold: u64) -> Self {
        Self {
            strategy,
            dust_threshold,
        }
    }

    pub fn strategy(&self) -> CoinSelectionStrategy {
        self.strategy
    }

    /// Select inputs covering `targets` plus fee at `fee_rate` sat/vbyte
    pub fn select(
        &self,
        utxos: &[Utxo],
        targets: &[SelectionTarget],
        change_script: &ScriptBuf,
        fee_rate: u64,
        allows_unconfirmed: bool,
    ) -> Result<Selection, SelectionError> {
        if targets.is_empty() {
            return Err(SelectionError::NoTargets);
        }
        if fee_rate == 0 {
            return Err(SelectionError::InvalidFeeRate);
        }

        let send_all_count = targets
            .iter()
            .filter(|t| matches!(t.value, TargetValue::SendAll))
            .count();
        if send_all_count > 1 {
            return Err(SelectionError::MultipleSendAll(send_all_count));
        }

        let fixed_total = targets
            .iter()
            .filter_map(|t| match t.value {
                TargetValue::Amount(v) => Some(v),
                TargetValue::SendAll => None,
            })
            .try_fold(0u64, |acc, v| acc.checked_add(v))
            .ok_or(SelectionError::Overflow)?;

        let outputs: Vec<TxOut> = targets
            .iter()
            .map(|t| weight::sizing_output(&t.script_pubkey))
            .collect();

        let eligible = self.eligible(utxos, allows_unconfirmed);

        let selection = if send_all_count == 1 {
            self.select_all(eligible, &outputs, fixed_total, fee_rate)?
        } else {
            self.select_fixed(eligible, &outputs, change_script, fixed_total, fee_rate)?
        };

        tracing::trace!(
            inputs = selection.inputs.len(),
            fee = selection.fee,
            change = ?selection.change,
            "coins selected"
        );

        Ok(selection)
    }

    /// Spendable UTXOs ordered for the configured strategy
    fn eligible<'a>(&self, utxos: &'a [Utxo], allows_unconfirmed: bool) -> Vec<&'a Utxo> {
        let mut eligible: Vec<&Utxo> = utxos
            .iter()
            .filter(|u| !u.frozen && u.value > 0)
            .filter(|u| allows_unconfirmed || !u.is_unconfirmed())
            .collect();

        let tie_break = |a: &&Utxo, b: &&Utxo| a.txid.cmp(&b.txid).then(a.vout.cmp(&b.vout));
        match self.strategy {
            CoinSelectionStrategy::SmallestFirst => {
                eligible.sort_by(|a, b| a.value.cmp(&b.value).then_with(|| tie_break(a, b)))
            }
            CoinSelectionStrategy::BranchAndBound | CoinSelectionStrategy::LargestFirst => {
                eligible.sort_by(|a, b| b.value.cmp(&a.value).then_with(|| tie_break(a, b)))
            }
        }
        eligible
    }

    /// Send-all: spend every eligible input, no change
    fn select_all(
        &self,
        eligible: Vec<&Utxo>,
        outputs: &[TxOut],
        fixed_total: u64,
        fee_rate: u64,
    ) -> Result<Selection, SelectionError> {
        let total_in = sum_values(&eligible)?;
        let vsize = weight::template_vsize(eligible.len().max(1), outputs);
        let fee = weight::fee_for_vsize(vsize, fee_rate).ok_or(SelectionError::Overflow)?;

        // The send-all output must itself clear the dust floor
        let needed = fixed_total
            .checked_add(fee)
            .and_then(|v| v.checked_add(self.dust_threshold.saturating_add(1)))
            .ok_or(SelectionError::Overflow)?;
        if eligible.is_empty() || total_in < needed {
            return Err(SelectionError::insufficient(needed, total_in));
        }

        let send_all_value = total_in - fixed_total - fee;
        Ok(Selection {
            inputs: eligible.into_iter().cloned().collect(),
            fee,
            change: None,
            send_all_value: Some(send_all_value),
            vsize,
        })
    }

    fn select_fixed(
        &self,
        eligible: Vec<&Utxo>,
        outputs: &[TxOut],
        change_script: &ScriptBuf,
        fixed_total: u64,
        fee_rate: u64,
    ) -> Result<Selection, SelectionError> {
        let mut with_change = outputs.to_vec();
        with_change.push(weight::sizing_output(change_script));

        if self.strategy == CoinSelectionStrategy::BranchAndBound {
            if let Some(selection) =
                self.branch_and_bound(&eligible, outputs, &with_change, fixed_total, fee_rate)?
            {
                return Ok(selection);
            }
        }

        let mut selected: Vec<&Utxo> = Vec::new();
        for utxo in &eligible {
            selected.push(*utxo);
            if let Some(eval) =
                self.evaluate(&selected, outputs, &with_change, fixed_total, fee_rate)?
            {
                return Ok(Selection {
                    inputs: selected.into_iter().cloned().collect(),
                    fee: eval.fee,
                    change: eval.change,
                    send_all_value: None,
                    vsize: eval.vsize,
                });
            }
        }

        // Shortfall is reported against spending everything we have
        let available = sum_values(&eligible)?;
        let vsize = weight::template_vsize(eligible.len().max(1), outputs);
        let fee = weight::fee_for_vsize(vsize, fee_rate).ok_or(SelectionError::Overflow)?;
        let needed = fixed_total.checked_add(fee).ok_or(SelectionError::Overflow)?;
        Err(SelectionError::insufficient(needed, available))
    }

    /// Exact fee and change for a candidate input set; `None` if it cannot pay
    fn evaluate(
        &self,
        inputs: &[&Utxo],
        outputs: &[TxOut],
        with_change: &[TxOut],
        fixed_total: u64,
        fee_rate: u64,
    ) -> Result<Option<Evaluation>, SelectionError> {
        let total_in = sum_values(inputs)?;

        let vsize = weight::template_vsize(inputs.len(), outputs);
        let fee = weight::fee_for_vsize(vsize, fee_rate).ok_or(SelectionError::Overflow)?;
        let required = fixed_total.checked_add(fee).ok_or(SelectionError::Overflow)?;
        if total_in < required {
            return Ok(None);
        }

        let change_vsize = weight::template_vsize(inputs.len(), with_change);
        let change_fee =
            weight::fee_for_vsize(change_vsize, fee_rate).ok_or(SelectionError::Overflow)?;
        if let Some(change) = total_in
            .checked_sub(fixed_total)
            .and_then(|v| v.checked_sub(change_fee))
        {
            if change > self.dust_threshold {
                return Ok(Some(Evaluation {
                    fee: change_fee,
                    change: Some(change),
                    vsize: change_vsize,
                }));
            }
        }

        // Leftover below dust is folded into the fee
        Ok(Some(Evaluation {
            fee: total_in - fixed_total,
            change: None,
            vsize,
        }))
    }

    /// Depth-first search for an input set that needs no change output
    fn branch_and_bound(
        &self,
        eligible: &[&Utxo],
        outputs: &[TxOut],
        with_change: &[TxOut],
        fixed_total: u64,
        fee_rate: u64,
    ) -> Result<Option<Selection>, SelectionError> {
        let input_fee = P2WPKH_INPUT_VBYTES
            .checked_mul(fee_rate)
            .ok_or(SelectionError::Overflow)?;

        // Pool of inputs worth more than their own spending cost, largest first
        let pool: Vec<(&Utxo, u64)> = eligible
            .iter()
            .filter(|u| u.value > input_fee)
            .map(|u| (*u, u.value - input_fee))
            .collect();
        if pool.is_empty() {
            return Ok(None);
        }

        let overhead_vsize = weight::template_vsize(1, outputs).saturating_sub(P2WPKH_INPUT_VBYTES);
        let overhead_fee =
            weight::fee_for_vsize(overhead_vsize, fee_rate).ok_or(SelectionError::Overflow)?;
        let target = fixed_total
            .checked_add(overhead_fee)
            .ok_or(SelectionError::Overflow)?;

        let change_output_fee = weight::fee_for_vsize(weight::P2WPKH_OUTPUT_VBYTES, fee_rate)
            .ok_or(SelectionError::Overflow)?;
        let cost_of_change = change_output_fee.saturating_add(self.dust_threshold);

        let mut available: u64 = pool
            .iter()
            .try_fold(0u64, |acc, (_, eff)| acc.checked_add(*eff))
            .ok_or(SelectionError::Overflow)?;
        let mut current: u64 = 0;
        let mut chosen: Vec<usize> = Vec::new();
        let mut best: Option<(u64, Vec<usize>, Evaluation)> = None;
        let mut index = 0usize;

        for _ in 0..BNB_MAX_TRIES {
            let mut backtrack = false;

            if current + available < target || current > target.saturating_add(cost_of_change) {
                backtrack = true;
            } else if current >= target {
                let candidate: Vec<&Utxo> = chosen.iter().map(|i| pool[*i].0).collect();
                if let Some(eval) =
                    self.evaluate(&candidate, outputs, with_change, fixed_total, fee_rate)?
                {
                    if eval.change.is_none() {
                        let waste = eval.fee.saturating_sub(
                            weight::fee_for_vsize(eval.vsize, fee_rate).unwrap_or(eval.fee),
                        );
                        let better = match &best {
                            None => true,
                            Some((best_waste, best_set, _)) => match waste.cmp(best_waste) {
                                Ordering::Less => true,
                                Ordering::Equal => chosen.len() < best_set.len(),
                                Ordering::Greater => false,
                            },
                        };
                        if better {
                            best = Some((waste, chosen.clone(), eval));
                        }
                    }
                }
                backtrack = true;
            }

            if backtrack {
                let Some(&last) = chosen.last() else {
                    break;
                };
                // Restore the look-ahead for everything skipped after the last inclusion
                while index > last + 1 {
                    index -= 1;
                    available += pool[index].1;
                }
                index = last;
                current -= pool[last].1;
                chosen.pop();
                // Exclusion branch: step past `last` without including it
                index += 1;
                continue;
            }

            let (_, eff) = pool[index];
            available -= eff;
            let skip_equivalent = index > 0
                && !chosen.is_empty()
                && chosen.last() != Some(&(index - 1))
                && pool[index - 1].1 == eff;
            if !skip_equivalent {
                chosen.push(index);
                current += eff;
            }
            index += 1;
        }

        Ok(best.map(|(_, set, eval)| Selection {
            inputs: set.into_iter().map(|i| pool[i].0.clone()).collect(),
            fee: eval.fee,
            change: None,
            send_all_value: None,
            vsize: eval.vsize,
        }))
    }
}

fn sum_values(utxos: &[&Utxo]) -> Result<u64, SelectionError> {
    utxos
        .iter()
        .try_fold(0u64, |acc, u| acc.checked_add(u.value))
        .ok_or(SelectionError::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::WPubkeyHash;

    fn script(byte: u8) -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([byte; 20]))
    }

    fn utxo(n: u8, value: u64) -> Utxo {
        Utxo::new(format!("{:064x}", n), 0, value, "bc1qowner")
    }

    fn target(value: u64) -> SelectionTarget {
        SelectionTarget {
            script_pubkey: script(1),
            value: TargetValue::Amount(value),
        }
    }

    fn selector(strategy: CoinSelectionStrategy) -> CoinSelector {
        CoinSelector::new(strategy, 546)
    }

    fn assert_balanced(selection: &Selection, fixed: u64) {
        let out = fixed + selection.change.unwrap_or(0) + selection.send_all_value.unwrap_or(0);
        assert_eq!(selection.total_in(), out + selection.fee);
    }

    #[test]
    fn test_largest_first_with_change() {
        let utxos = vec![utxo(1, 10_000), utxo(2, 50_000), utxo(3, 20_000)];
        let selection = selector(CoinSelectionStrategy::LargestFirst)
            .select(&utxos, &[target(30_000)], &script(9), 2, false)
            .unwrap();

        assert_eq!(selection.inputs.len(), 1);
        assert_eq!(selection.inputs[0].value, 50_000);
        // 1 input, 2 outputs = 141 vbytes
        assert_eq!(selection.fee, 282);
        assert_eq!(selection.change, Some(50_000 - 30_000 - 282));
        assert_balanced(&selection, 30_000);
    }

    #[test]
    fn test_smallest_first_accumulates() {
        let utxos = vec![utxo(1, 10_000), utxo(2, 50_000), utxo(3, 20_000)];
        let selection = selector(CoinSelectionStrategy::SmallestFirst)
            .select(&utxos, &[target(25_000)], &script(9), 1, false)
            .unwrap();

        let values: Vec<u64> = selection.inputs.iter().map(|u| u.value).collect();
        assert_eq!(values, vec![10_000, 20_000]);
        assert_balanced(&selection, 25_000);
    }

    #[test]
    fn test_small_leftover_folded_into_fee() {
        // 1 input, 1 output = 110 vbytes; leftover after change output would be dust
        let utxos = vec![utxo(1, 10_500)];
        let selection = selector(CoinSelectionStrategy::LargestFirst)
            .select(&utxos, &[target(10_000)], &script(9), 1, false)
            .unwrap();

        assert_eq!(selection.change, None);
        assert_eq!(selection.fee, 500);
        assert_balanced(&selection, 10_000);
    }

    #[test]
    fn test_branch_and_bound_finds_changeless_match() {
        // 1 input + 1 output at 1 sat/vbyte costs 110
        let utxos = vec![utxo(1, 100_000), utxo(2, 20_110), utxo(3, 7_000)];
        let selection = selector(CoinSelectionStrategy::BranchAndBound)
            .select(&utxos, &[target(20_000)], &script(9), 1, false)
            .unwrap();

        assert_eq!(selection.inputs.len(), 1);
        assert_eq!(selection.inputs[0].value, 20_110);
        assert_eq!(selection.change, None);
        assert_eq!(selection.fee, 110);
    }

    #[test]
    fn test_branch_and_bound_falls_back_to_largest_first() {
        let utxos = vec![utxo(1, 100_000), utxo(2, 3_000)];
        let selection = selector(CoinSelectionStrategy::BranchAndBound)
            .select(&utxos, &[target(20_000)], &script(9), 1, false)
            .unwrap();

        assert_eq!(selection.inputs[0].value, 100_000);
        assert!(selection.change.is_some());
        assert_balanced(&selection, 20_000);
    }

    #[test]
    fn test_insufficient_funds_reports_shortfall() {
        let utxos = vec![utxo(1, 1_000)];
        let err = selector(CoinSelectionStrategy::BranchAndBound)
            .select(&utxos, &[target(2_000)], &script(9), 5, false)
            .unwrap_err();

        match err {
            SelectionError::InsufficientFunds {
                needed,
                available,
                shortfall,
            } => {
                assert_eq!(available, 1_000);
                assert_eq!(needed, 2_000 + 110 * 5);
                assert!(shortfall >= 1_000);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_send_all_with_extreme_dust_threshold() {
        let utxos = vec![utxo(1, 30_000)];
        let targets = vec![SelectionTarget {
            script_pubkey: script(2),
            value: TargetValue::SendAll,
        }];
        let result = CoinSelector::new(CoinSelectionStrategy::LargestFirst, u64::MAX)
            .select(&utxos, &targets, &script(9), 1, false);

        assert!(matches!(result, Err(SelectionError::Overflow)));
    }

    #[test]
    fn test_send_all_absorbs_remainder() {
        let utxos = vec![utxo(1, 30_000), utxo(2, 20_000)];
        let targets = vec![
            target(5_000),
            SelectionTarget {
                script_pubkey: script(2),
                value: TargetValue::SendAll,
            },
        ];
        let selection = selector(CoinSelectionStrategy::LargestFirst)
            .select(&utxos, &targets, &script(9), 3, false)
            .unwrap();

        assert_eq!(selection.inputs.len(), 2);
        assert_eq!(selection.change, None);
        let send_all = selection.send_all_value.unwrap();
        assert_eq!(send_all, 50_000 - 5_000 - selection.fee);
        assert_balanced(&selection, 5_000);
    }

    #[test]
    fn test_send_all_below_dust_is_insufficient() {
        // 110 vbytes of fee leaves 490 for the output
        let utxos = vec![utxo(1, 600)];
        let targets = vec![SelectionTarget {
            script_pubkey: script(2),
            value: TargetValue::SendAll,
        }];
        let err = selector(CoinSelectionStrategy::LargestFirst)
            .select(&utxos, &targets, &script(9), 1, false)
            .unwrap_err();
        assert!(matches!(err, SelectionError::InsufficientFunds { .. }));
    }

    #[test]
    fn test_multiple_send_all_rejected() {
        let send_all = SelectionTarget {
            script_pubkey: script(2),
            value: TargetValue::SendAll,
        };
        let err = selector(CoinSelectionStrategy::LargestFirst)
            .select(
                &[utxo(1, 10_000)],
                &[send_all.clone(), send_all],
                &script(9),
                1,
                false,
            )
            .unwrap_err();
        assert_eq!(err, SelectionError::MultipleSendAll(2));
    }

    #[test]
    fn test_frozen_and_unconfirmed_skipped() {
        let utxos = vec![
            utxo(1, 90_000).frozen(),
            utxo(2, 80_000).with_confirmations(0),
            utxo(3, 40_000).with_confirmations(2),
        ];
        let selection = selector(CoinSelectionStrategy::LargestFirst)
            .select(&utxos, &[target(30_000)], &script(9), 1, false)
            .unwrap();
        assert_eq!(selection.inputs[0].value, 40_000);

        let selection = selector(CoinSelectionStrategy::LargestFirst)
            .select(&utxos, &[target(30_000)], &script(9), 1, true)
            .unwrap();
        assert_eq!(selection.inputs[0].value, 80_000);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let utxos: Vec<Utxo> = (1..=12).map(|n| utxo(n, 5_000)).collect();
        let sel = selector(CoinSelectionStrategy::BranchAndBound);
        let first = sel.select(&utxos, &[target(17_000)], &script(9), 2, false).unwrap();
        for _ in 0..5 {
            let again = sel.select(&utxos, &[target(17_000)], &script(9), 2, false).unwrap();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_zero_fee_rate_rejected() {
        let err = selector(CoinSelectionStrategy::LargestFirst)
            .select(&[utxo(1, 10_000)], &[target(1_000)], &script(9), 0, false)
            .unwrap_err();
        assert_eq!(err, SelectionError::InvalidFeeRate);
    }
}
