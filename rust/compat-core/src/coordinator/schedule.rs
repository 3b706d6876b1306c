//! Wave scheduling for the pairwise bandwidth mesh.
//!
//! Every unordered pair of roster positions is measured exactly once. Pairs
//! are grouped into sequential waves; inside a wave no node appears twice, so
//! concurrent measurements never share an endpoint.

use std::collections::HashSet;

/// One pair of roster positions with the ports its two directions use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledPair {
    /// Index of the lower roster position.
    pub a: usize,
    /// Index of the higher roster position.
    pub b: usize,
    /// Server port on `b` for the A->B direction.
    pub forward_port: u16,
    /// Server port on `a` for the B->A direction.
    pub reverse_port: u16,
}

/// All unordered pairs of `0..n` in lexicographic order.
pub fn unordered_pairs(n: usize) -> Vec<(usize, usize)> {
    (0..n)
        .flat_map(|a| (a + 1..n).map(move |b| (a, b)))
        .collect()
}

/// Group the pairs of `0..n` into waves.
///
/// Greedy: each wave walks the remaining pairs in order and takes every
/// pair whose endpoints are both still idle in this wave, up to
/// `max_concurrent` pairs. Ports are assigned from `port_base` by the
/// pair's position in lexicographic order, two per pair.
pub fn schedule_waves(n: usize, max_concurrent: Option<usize>, port_base: u16) -> Vec<Vec<ScheduledPair>> {
    let limit = max_concurrent.unwrap_or(usize::MAX).max(1);
    let mut remaining: Vec<ScheduledPair> = unordered_pairs(n)
        .into_iter()
        .enumerate()
        .map(|(i, (a, b))| {
            let offset = (2 * i) as u16;
            ScheduledPair {
                a,
                b,
                forward_port: port_base.wrapping_add(offset),
                reverse_port: port_base.wrapping_add(offset + 1),
            }
        })
        .collect();

    let mut waves = Vec::new();
    while !remaining.is_empty() {
        let mut busy = HashSet::new();
        let mut wave = Vec::new();
        remaining.retain(|pair| {
            if wave.len() < limit && !busy.contains(&pair.a) && !busy.contains(&pair.b) {
                busy.insert(pair.a);
                busy.insert(pair.b);
                wave.push(*pair);
                false
            } else {
                true
            }
        });
        waves.push(wave);
    }
    waves
}
