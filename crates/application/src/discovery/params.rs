use serde::{Deserialize, Serialize};

use domain::driver::SupportedConfig;
use domain::link::{BAUD_RATES, Candidate, LinkParams, Parity, SlaveId};

/// How wide the candidate space should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStrategy {
    /// Driver-supplied ranges when available, else the common field set
    #[default]
    Quick,
    /// Same structure over the full baud set
    Thorough,
}

#[derive(Debug, Clone, Default)]
pub struct GeneratorOptions {
    pub strategy: ScanStrategy,
    pub supported: Option<SupportedConfig>,
}

const QUICK_BAUD_RATES: [u32; 2] = [9600, 19200];
const DEFAULT_PARITIES: [Parity; 3] = [Parity::None, Parity::Even, Parity::Odd];

/// The ordered candidate space of one scan.
///
/// Emission order is a contract the scanner depends on: link-parameter
/// combinations in lexicographic field order (baud rate, parity, data bits,
/// stop bits), slave ids ascending inside each combination, so candidates
/// sharing link parameters are contiguous.
#[derive(Debug, Clone)]
pub struct ParameterSpace {
    baud_rates: Vec<u32>,
    parities: Vec<Parity>,
    data_bits: Vec<u8>,
    stop_bits: Vec<u8>,
    first_address: u8,
    last_address: u8,
}

impl ParameterSpace {
    pub fn new(options: &GeneratorOptions) -> Self {
        let supported = options.supported.as_ref();
        let baud_rates = match options.strategy {
            ScanStrategy::Quick => supported
                .map(|s| s.baud_rates.clone())
                .unwrap_or_else(|| QUICK_BAUD_RATES.to_vec()),
            ScanStrategy::Thorough => BAUD_RATES.to_vec(),
        };
        let (first_address, last_address) = supported
            .map(|s| s.address_range)
            .unwrap_or((SlaveId::MIN, SlaveId::MAX));
        Self {
            baud_rates,
            parities: supported
                .map(|s| s.parities.clone())
                .unwrap_or_else(|| DEFAULT_PARITIES.to_vec()),
            data_bits: supported.map(|s| s.data_bits.clone()).unwrap_or(vec![8]),
            stop_bits: supported.map(|s| s.stop_bits.clone()).unwrap_or(vec![1]),
            first_address: first_address.clamp(SlaveId::MIN, SlaveId::MAX),
            last_address: last_address.clamp(SlaveId::MIN, SlaveId::MAX),
        }
    }

    fn address_count(&self) -> usize {
        if self.first_address > self.last_address {
            0
        } else {
            (self.last_address - self.first_address) as usize + 1
        }
    }

    /// Total candidates, computed up front for progress reporting.
    pub fn total(&self) -> usize {
        self.baud_rates.len()
            * self.parities.len()
            * self.data_bits.len()
            * self.stop_bits.len()
            * self.address_count()
    }

    /// Link-parameter combinations in emission order.
    pub fn links(&self) -> Vec<LinkParams> {
        let mut links =
            Vec::with_capacity(self.baud_rates.len() * self.parities.len() * self.data_bits.len());
        for &baud_rate in &self.baud_rates {
            for &parity in &self.parities {
                for &data_bits in &self.data_bits {
                    for &stop_bits in &self.stop_bits {
                        links.push(LinkParams {
                            baud_rate,
                            parity,
                            data_bits,
                            stop_bits,
                        });
                    }
                }
            }
        }
        links
    }

    /// Ascending slave ids of one group.
    pub fn slave_ids(&self) -> Vec<SlaveId> {
        (self.first_address..=self.last_address)
            .filter_map(|raw| SlaveId::new(raw).ok())
            .collect()
    }

    /// Candidates grouped by link parameters, in emission order.
    pub fn groups(&self) -> Vec<(LinkParams, Vec<SlaveId>)> {
        let slave_ids = self.slave_ids();
        if slave_ids.is_empty() {
            return Vec::new();
        }
        self.links()
            .into_iter()
            .map(|link| (link, slave_ids.clone()))
            .collect()
    }

    /// The flat ordered candidate sequence.
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut candidates = Vec::with_capacity(self.total());
        for (link, slave_ids) in self.groups() {
            for slave_id in slave_ids {
                candidates.push(Candidate { link, slave_id });
            }
        }
        candidates
    }
}
