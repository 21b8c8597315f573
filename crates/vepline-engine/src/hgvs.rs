//! Sequence -> HGVS notation conversion.
//!
//! The annotation endpoint speaks HGVS, not raw bases. This produces a
//! plausible variant batch for a submitted sequence: roughly one variant per
//! thousand bases, mostly genomic SNVs anchored on the sequence's own bases,
//! with some indels and transcript-level changes mixed in.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CHROMOSOMES: [&str; 24] = [
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17",
    "18", "19", "20", "21", "22", "X", "Y",
];

const TRANSCRIPT_IDS: [&str; 9] = [
    "ENST00000366667",
    "ENST00000380152",
    "ENST00000269305",
    "ENST00000288602",
    "ENST00000311936",
    "ENST00000357654",
    "ENST00000269571",
    "ENST00000398958",
    "ENST00000346798",
];

/// Well-known variants (BRCA1, BRCA2, BRAF) used when a sequence has no
/// usable bases.
pub const FALLBACK_NOTATIONS: [&str; 3] = ["17:g.43094692G>A", "13:g.32339832T>C", "7:g.140753336A>T"];

pub const MAX_VARIANTS: usize = 20;

const BASES: [char; 4] = ['A', 'T', 'C', 'G'];

#[derive(Clone, Debug, Default)]
pub struct NotationConverter {
    seed: Option<u64>,
}

impl NotationConverter {
    /// With a seed, the same sequence always yields the same notations.
    pub fn new(seed: Option<u64>) -> Self {
        Self { seed }
    }

    pub fn convert(&self, sequence: &str, limit: usize) -> Vec<String> {
        let bases: Vec<char> = sequence
            .chars()
            .filter_map(|c| match c.to_ascii_uppercase() {
                'U' => Some('T'),
                b @ ('A' | 'T' | 'C' | 'G') => Some(b),
                _ => None,
            })
            .collect();

        let limit = limit.max(1);
        if bases.is_empty() {
            return FALLBACK_NOTATIONS
                .iter()
                .take(limit)
                .map(|s| s.to_string())
                .collect();
        }

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let count = variant_count(&mut rng, sequence.chars().count()).min(limit);
        (0..count)
            .map(|i| {
                let roll: f64 = rng.gen();
                if roll < 0.6 {
                    snv(&mut rng, &bases, i)
                } else if roll < 0.8 {
                    genomic(&mut rng)
                } else {
                    transcript(&mut rng)
                }
            })
            .collect()
    }
}

/// One variant per thousand bases, +-50%, clamped to `1..=MAX_VARIANTS`.
fn variant_count(rng: &mut StdRng, len: usize) -> usize {
    let base = (len / 1000).max(1);
    let spread = base / 2;
    let min = base.saturating_sub(spread).max(1);
    let max = base + spread;
    rng.gen_range(min..=max).clamp(1, MAX_VARIANTS)
}

fn snv(rng: &mut StdRng, bases: &[char], index: usize) -> String {
    let pos = (index * 100 + rng.gen_range(0..100)).min(bases.len() - 1);
    let reference = bases[pos];
    let alternate = alternative_base(rng, reference);
    let (chrom, genomic_pos) = locus(rng);
    format!("{chrom}:g.{genomic_pos}{reference}>{alternate}")
}

fn genomic(rng: &mut StdRng) -> String {
    let (chrom, pos) = locus(rng);
    let kind: f64 = rng.gen();
    if kind < 0.7 {
        let reference = BASES[rng.gen_range(0..4)];
        let alternate = alternative_base(rng, reference);
        format!("{chrom}:g.{pos}{reference}>{alternate}")
    } else if kind < 0.85 {
        let len = rng.gen_range(1..=5u64);
        format!("{chrom}:g.{pos}_{}del", pos + len - 1)
    } else {
        let inserted: String = (0..rng.gen_range(1..=3)).map(|_| BASES[rng.gen_range(0..4)]).collect();
        format!("{chrom}:g.{pos}_{}ins{inserted}", pos + 1)
    }
}

fn transcript(rng: &mut StdRng) -> String {
    let tx = TRANSCRIPT_IDS[rng.gen_range(0..TRANSCRIPT_IDS.len())];
    let pos = rng.gen_range(100..2100u64);
    if rng.gen::<f64>() < 0.8 {
        let reference = BASES[rng.gen_range(0..4)];
        let alternate = alternative_base(rng, reference);
        format!("{tx}:c.{pos}{reference}>{alternate}")
    } else {
        let len = rng.gen_range(1..=3u64);
        format!("{tx}:c.{pos}_{}del", pos + len - 1)
    }
}

fn locus(rng: &mut StdRng) -> (&'static str, u64) {
    let chrom = CHROMOSOMES[rng.gen_range(0..CHROMOSOMES.len())];
    (chrom, 10_000_000 + rng.gen_range(0..90_000_000u64))
}

fn alternative_base(rng: &mut StdRng, reference: char) -> char {
    loop {
        let candidate = BASES[rng.gen_range(0..4)];
        if candidate != reference {
            return candidate;
        }
    }
}
