//! Stimulus table and the source/target domain partition.
//!
//! All frequency-keyed arrays in this crate are indexed by *canonical
//! position*: the rank of a stimulus after sorting by frequency. The natural
//! index (display order on the keyboard) is only used at the edges, when a
//! caller hands in a calibration tensor or asks for a symbol.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TlccaError};

/// Flicker frequencies of the 40-target keyboard, in natural (display) order.
pub const BENCHMARK_FREQUENCIES: [f64; 40] = [
    8.6, 8.8, 9.0, 9.2, 9.4, 9.6, 9.8, 10.0, 10.2, 10.4, 10.6, 10.8, 11.0, 11.2, 11.4, 11.6, 11.8,
    12.0, 12.2, 12.4, 12.6, 12.8, 13.0, 13.2, 13.4, 13.6, 13.8, 14.0, 14.2, 14.4, 14.6, 14.8, 15.0,
    15.2, 15.4, 15.6, 15.8, 8.0, 8.2, 8.4,
];

pub const BENCHMARK_SYMBOLS: [char; 40] = [
    '.', ',', '<', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p',
    'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8',
    '9', '_',
];

/// Phase of the benchmark stimulus at natural index `i`: cycles 0, π/2, π, 3π/2.
pub fn benchmark_phase(i: usize) -> f64 {
    (i % 4) as f64 * 0.5 * PI
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StimulusFrequency {
    /// Natural (display) index of the symbol.
    pub index: usize,
    pub frequency_hz: f64,
    pub phase_rad: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StimulusTableRepr {
    frequencies: Vec<f64>,
    phases: Vec<f64>,
    target_order: Vec<usize>,
}

/// Frequency/phase table in canonical order plus the `target_order` permutation.
///
/// `target_order[p]` is the natural index of the stimulus at canonical
/// position `p`. Both directions of that mapping are precomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StimulusTableRepr", into = "StimulusTableRepr")]
pub struct StimulusTable {
    frequencies: Vec<f64>,
    phases: Vec<f64>,
    target_order: Vec<usize>,
    natural_to_canonical: Vec<usize>,
}

impl StimulusTable {
    /// Builds the table from natural-order frequencies and phases.
    pub fn from_natural(frequencies: &[f64], phases: &[f64]) -> Result<Self> {
        if frequencies.len() != phases.len() {
            return Err(TlccaError::InvalidInput(format!(
                "{} frequencies but {} phases",
                frequencies.len(),
                phases.len()
            )));
        }
        if frequencies.iter().any(|f| !f.is_finite()) {
            return Err(TlccaError::InvalidInput("non-finite stimulus frequency".into()));
        }
        let mut target_order: Vec<usize> = (0..frequencies.len()).collect();
        target_order.sort_by(|&a, &b| frequencies[a].total_cmp(&frequencies[b]));

        StimulusTableRepr {
            frequencies: target_order.iter().map(|&i| frequencies[i]).collect(),
            phases: target_order.iter().map(|&i| phases[i]).collect(),
            target_order,
        }
        .try_into()
    }

    /// The 40-target benchmark keyboard.
    pub fn benchmark() -> Self {
        let phases: Vec<f64> = (0..BENCHMARK_FREQUENCIES.len()).map(benchmark_phase).collect();
        // The constant table is well formed; this cannot fail.
        match Self::from_natural(&BENCHMARK_FREQUENCIES, &phases) {
            Ok(table) => table,
            Err(e) => unreachable!("benchmark stimulus table rejected: {e}"),
        }
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    /// Frequency at canonical position `pos`.
    pub fn frequency(&self, pos: usize) -> f64 {
        self.frequencies[pos]
    }

    pub fn phase(&self, pos: usize) -> f64 {
        self.phases[pos]
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn phases(&self) -> &[f64] {
        &self.phases
    }

    pub fn target_order(&self) -> &[usize] {
        &self.target_order
    }

    pub fn canonical_to_natural(&self, pos: usize) -> usize {
        self.target_order[pos]
    }

    pub fn natural_to_canonical(&self, natural: usize) -> usize {
        self.natural_to_canonical[natural]
    }

    pub fn stimulus(&self, pos: usize) -> StimulusFrequency {
        StimulusFrequency {
            index: self.target_order[pos],
            frequency_hz: self.frequencies[pos],
            phase_rad: self.phases[pos],
        }
    }

    /// Iterates stimuli in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = StimulusFrequency> + '_ {
        (0..self.len()).map(|pos| self.stimulus(pos))
    }
}

impl TryFrom<StimulusTableRepr> for StimulusTable {
    type Error = TlccaError;

    fn try_from(repr: StimulusTableRepr) -> Result<Self> {
        let n = repr.frequencies.len();
        if n == 0 {
            return Err(TlccaError::MalformedModel("empty frequency table".into()));
        }
        if repr.phases.len() != n || repr.target_order.len() != n {
            return Err(TlccaError::MalformedModel(format!(
                "stimulus table sizes differ: {} frequencies, {} phases, {} order entries",
                n,
                repr.phases.len(),
                repr.target_order.len()
            )));
        }
        if repr.frequencies.windows(2).any(|w| w[0] > w[1]) {
            return Err(TlccaError::MalformedModel(
                "frequencies are not in canonical (ascending) order".into(),
            ));
        }

        let mut natural_to_canonical = vec![usize::MAX; n];
        for (pos, &natural) in repr.target_order.iter().enumerate() {
            if natural >= n || natural_to_canonical[natural] != usize::MAX {
                return Err(TlccaError::MalformedModel(
                    "target_order is not a permutation".into(),
                ));
            }
            natural_to_canonical[natural] = pos;
        }

        Ok(Self {
            frequencies: repr.frequencies,
            phases: repr.phases,
            target_order: repr.target_order,
            natural_to_canonical,
        })
    }
}

impl From<StimulusTable> for StimulusTableRepr {
    fn from(table: StimulusTable) -> Self {
        Self {
            frequencies: table.frequencies,
            phases: table.phases,
            target_order: table.target_order,
        }
    }
}

/// Which domain a canonical position belongs to, with its index inside that domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Calibrated stimulus; index into the source weight columns.
    Source(usize),
    /// Uncalibrated stimulus; index into the transfer weight/template columns.
    Target(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DomainPartitionRepr {
    source_indices: Vec<usize>,
    target_indices: Vec<usize>,
}

/// Split of canonical positions into calibrated (source) and synthesized (target) stimuli.
///
/// `source_indices[i]` and `target_indices[i]` are one canonical rank apart;
/// transfer learning for target `i` starts from source `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DomainPartitionRepr", into = "DomainPartitionRepr")]
pub struct DomainPartition {
    source_indices: Vec<usize>,
    target_indices: Vec<usize>,
    lookup: Vec<Domain>,
}

impl DomainPartition {
    /// Odd canonical positions are calibrated, even positions are transferred.
    pub fn alternating(n: usize) -> Result<Self> {
        DomainPartitionRepr {
            source_indices: (1..n).step_by(2).collect(),
            target_indices: (0..n).step_by(2).collect(),
        }
        .try_into()
    }

    pub fn source_indices(&self) -> &[usize] {
        &self.source_indices
    }

    pub fn target_indices(&self) -> &[usize] {
        &self.target_indices
    }

    pub fn num_source(&self) -> usize {
        self.source_indices.len()
    }

    pub fn num_target(&self) -> usize {
        self.target_indices.len()
    }

    /// Total number of canonical positions covered.
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    pub fn domain(&self, pos: usize) -> Domain {
        self.lookup[pos]
    }
}

impl TryFrom<DomainPartitionRepr> for DomainPartition {
    type Error = TlccaError;

    fn try_from(repr: DomainPartitionRepr) -> Result<Self> {
        if repr.source_indices.is_empty() || repr.target_indices.is_empty() {
            return Err(TlccaError::MalformedModel("empty domain partition".into()));
        }
        if repr.source_indices.len() != repr.target_indices.len() {
            return Err(TlccaError::MalformedModel(format!(
                "{} source stimuli but {} target stimuli",
                repr.source_indices.len(),
                repr.target_indices.len()
            )));
        }

        let n = repr.source_indices.len() + repr.target_indices.len();
        let mut lookup: Vec<Option<Domain>> = vec![None; n];
        let entries = repr
            .source_indices
            .iter()
            .enumerate()
            .map(|(i, &pos)| (pos, Domain::Source(i)))
            .chain(
                repr.target_indices
                    .iter()
                    .enumerate()
                    .map(|(i, &pos)| (pos, Domain::Target(i))),
            );
        for (pos, domain) in entries {
            match lookup.get_mut(pos) {
                Some(slot) if slot.is_none() => *slot = Some(domain),
                _ => {
                    return Err(TlccaError::MalformedModel(format!(
                        "canonical position {pos} assigned twice or out of range"
                    )))
                }
            }
        }

        for (s, t) in repr.source_indices.iter().zip(&repr.target_indices) {
            if s.abs_diff(*t) != 1 {
                return Err(TlccaError::MalformedModel(format!(
                    "source {s} and target {t} are not frequency neighbours"
                )));
            }
        }

        Ok(Self {
            source_indices: repr.source_indices,
            target_indices: repr.target_indices,
            lookup: lookup.into_iter().flatten().collect(),
        })
    }
}

impl From<DomainPartition> for DomainPartitionRepr {
    fn from(partition: DomainPartition) -> Self {
        Self {
            source_indices: partition.source_indices,
            target_indices: partition.target_indices,
        }
    }
}
