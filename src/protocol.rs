//! Excitation and measurement sequences ("protocols") for a ring of electrodes.
//!
//! A protocol is an ordered list of [`ProtocolEntry`]s,
//! each naming the pair of electrodes current is injected through
//! and the pair of electrodes a voltage is measured between.
//! The order of entries is the order of values in every
//! [`VoltageVector`][crate::VoltageVector]
//! used with the protocol, both simulated and measured.

use fixedbitset as fb;

/// Error in generating a measurement protocol.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidProtocolError {
    /// At least two electrodes are needed to form a pair.
    #[error("At least 2 electrodes are required, got {0}")]
    TooFewElectrodes(usize),
    /// The excitation stride maps every electrode onto itself.
    #[error("Excitation stride {stride} is a multiple of the electrode count {electrode_count}")]
    DegenerateExcitation {
        /// The stride given.
        stride: usize,
        /// Number of electrodes in the ring.
        electrode_count: usize,
    },
    /// The measurement stride maps every electrode onto itself.
    #[error("Measurement stride {stride} is a multiple of the electrode count {electrode_count}")]
    DegenerateMeasurement {
        /// The stride given.
        stride: usize,
        /// Number of electrodes in the ring.
        electrode_count: usize,
    },
    /// Every measurement was excluded.
    #[error("Protocol has no measurements")]
    NoMeasurements,
}

/// Which measurements to leave out of the protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ExclusionPolicy {
    /// Drop measurements where either sense electrode
    /// is also one of the current-carrying source electrodes.
    /// Voltages on driven electrodes are dominated by contact impedance
    /// and are not used for imaging.
    #[default]
    ExcludeAdjacent,
    /// Keep every measurement.
    None,
}

/// Where the walk around the ring of sense pairs starts for each excitation.
///
/// This only affects the order of entries, not which entries exist.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MeasurementStart {
    /// Start at the positive source electrode of each excitation,
    /// so every excitation sees the same pattern relative to itself
    /// (the convention of e.g. Dräger PulmoVista devices).
    #[default]
    Rotating,
    /// Always start at electrode 0.
    Fixed,
}

/// A single measurement: inject current between two electrodes,
/// measure the voltage between two electrodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolEntry {
    /// Electrode current flows in through.
    pub src_pos: usize,
    /// Electrode current flows out through.
    pub src_neg: usize,
    /// Electrode whose potential is taken as positive.
    pub sense_pos: usize,
    /// Electrode whose potential is subtracted.
    pub sense_neg: usize,
}

impl ProtocolEntry {
    /// The entry as a `(src+, src-, sense+, sense-)` tuple.
    #[inline]
    pub fn as_tuple(&self) -> (usize, usize, usize, usize) {
        (self.src_pos, self.src_neg, self.sense_pos, self.sense_neg)
    }

    /// Whether a sense electrode coincides with a source electrode.
    #[inline]
    pub fn senses_on_source(&self) -> bool {
        let sources = [self.src_pos, self.src_neg];
        sources.contains(&self.sense_pos) || sources.contains(&self.sense_neg)
    }
}

/// An ordered sequence of measurements making up one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Protocol {
    electrode_count: usize,
    entries: Vec<ProtocolEntry>,
    /// distinct (src+, src-) pairs in order of appearance
    excitations: Vec<(usize, usize)>,
    /// index into `excitations` for each entry
    excitation_of_entry: Vec<usize>,
    /// which measurements of the full table
    /// (`electrode_count` per excitation) are kept
    keep_mask: fb::FixedBitSet,
}

impl Protocol {
    /// Create a protocol for a ring of `electrode_count` electrodes.
    ///
    /// Excitation `k` drives current from electrode `k`
    /// to electrode `(k + exc_stride) % electrode_count`.
    /// For each excitation `(a, b)`, sense pairs are
    /// `(m + meas_stride, m)` (modulo `electrode_count`)
    /// for `m` walking once around the ring starting from `a`,
    /// with measurements removed according to `exclusion_policy`.
    ///
    /// ```
    /// # use eitrs::{ExclusionPolicy, Protocol};
    /// let protocol = Protocol::create(16, 1, 1, ExclusionPolicy::ExcludeAdjacent).unwrap();
    /// assert_eq!(protocol.len(), 208);
    /// assert_eq!(protocol.entries()[0].as_tuple(), (0, 1, 3, 2));
    /// ```
    pub fn create(
        electrode_count: usize,
        exc_stride: usize,
        meas_stride: usize,
        exclusion_policy: ExclusionPolicy,
    ) -> Result<Self, InvalidProtocolError> {
        Self::create_with_start(
            electrode_count,
            exc_stride,
            meas_stride,
            exclusion_policy,
            MeasurementStart::default(),
        )
    }

    /// Create a protocol with an explicit choice of
    /// where each excitation's sense pairs start.
    ///
    /// See [`create`][Self::create] for the other parameters.
    pub fn create_with_start(
        electrode_count: usize,
        exc_stride: usize,
        meas_stride: usize,
        exclusion_policy: ExclusionPolicy,
        start: MeasurementStart,
    ) -> Result<Self, InvalidProtocolError> {
        let n = electrode_count;
        if n < 2 {
            return Err(InvalidProtocolError::TooFewElectrodes(n));
        }
        if exc_stride % n == 0 {
            return Err(InvalidProtocolError::DegenerateExcitation {
                stride: exc_stride,
                electrode_count: n,
            });
        }
        if meas_stride % n == 0 {
            return Err(InvalidProtocolError::DegenerateMeasurement {
                stride: meas_stride,
                electrode_count: n,
            });
        }

        let excitations: Vec<(usize, usize)> = (0..n).map(|k| (k, (k + exc_stride) % n)).collect();

        let mut entries = Vec::new();
        let mut excitation_of_entry = Vec::new();
        let mut keep_mask = fb::FixedBitSet::with_capacity(n * n);
        for (exc_idx, &(a, b)) in excitations.iter().enumerate() {
            let first = match start {
                MeasurementStart::Rotating => a,
                MeasurementStart::Fixed => 0,
            };
            for i in 0..n {
                let m = (first + i) % n;
                let entry = ProtocolEntry {
                    src_pos: a,
                    src_neg: b,
                    sense_pos: (m + meas_stride) % n,
                    sense_neg: m,
                };
                let keep = match exclusion_policy {
                    ExclusionPolicy::ExcludeAdjacent => !entry.senses_on_source(),
                    ExclusionPolicy::None => true,
                };
                if keep {
                    keep_mask.insert(exc_idx * n + i);
                    entries.push(entry);
                    excitation_of_entry.push(exc_idx);
                }
            }
        }

        if entries.is_empty() {
            return Err(InvalidProtocolError::NoMeasurements);
        }
        log::debug!(
            "protocol for {n} electrodes: {} excitations, {} measurements",
            excitations.len(),
            entries.len()
        );

        Ok(Self {
            electrode_count,
            entries,
            excitations,
            excitation_of_entry,
            keep_mask,
        })
    }

    /// Number of electrodes the protocol was built for.
    #[inline]
    pub fn electrode_count(&self) -> usize {
        self.electrode_count
    }

    /// Number of measurements in one frame.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the protocol is empty. Never true for a successfully created protocol.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The measurements in frame order.
    #[inline]
    pub fn entries(&self) -> &[ProtocolEntry] {
        &self.entries
    }

    /// The distinct current injection pairs, in the order they are driven.
    #[inline]
    pub fn excitations(&self) -> &[(usize, usize)] {
        &self.excitations
    }

    /// The index into [`excitations`][Self::excitations] of each entry.
    #[inline]
    pub fn excitation_of_entry(&self) -> &[usize] {
        &self.excitation_of_entry
    }

    /// Which measurements of the full table are part of the protocol.
    ///
    /// The full table has `electrode_count` measurements per excitation
    /// in the same order as the protocol walks them,
    /// which is how devices that don't drop driven electrodes
    /// report their frames.
    #[inline]
    pub fn keep_mask(&self) -> &fb::FixedBitSet {
        &self.keep_mask
    }

    /// Select this protocol's measurements out of a full-table frame
    /// (see [`keep_mask`][Self::keep_mask]).
    ///
    /// Returns `None` if the frame isn't `electrode_count²` long.
    pub fn reduce_full_frame(&self, full: &[f64]) -> Option<crate::VoltageVector> {
        if full.len() != self.electrode_count * self.electrode_count {
            return None;
        }
        Some(crate::VoltageVector::from_iterator(
            self.entries.len(),
            self.keep_mask.ones().map(|i| full[i]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_16_electrode_reference() {
        let protocol = Protocol::create(16, 1, 1, ExclusionPolicy::ExcludeAdjacent).unwrap();
        // 16 excitations, 3 of 16 sense pairs touch a source electrode
        assert_eq!(protocol.len(), 208);
        assert_eq!(protocol.excitations().len(), 16);
        assert_eq!(protocol.entries()[0].as_tuple(), (0, 1, 3, 2));
        assert_eq!(protocol.entries()[12].as_tuple(), (0, 1, 15, 14));
        assert_eq!(protocol.entries()[13].as_tuple(), (1, 2, 4, 3));
        assert_eq!(protocol.entries()[207].as_tuple(), (15, 0, 14, 13));
    }

    #[test]
    fn exclusion_removes_source_electrodes() {
        for (n, exc, meas) in [(16, 1, 1), (16, 8, 1), (16, 4, 3), (8, 3, 2), (32, 5, 5)] {
            let protocol = Protocol::create(n, exc, meas, ExclusionPolicy::ExcludeAdjacent)
                .expect("valid protocol");
            for entry in protocol.entries() {
                assert!(!entry.senses_on_source(), "{entry:?} senses on a source");
                for idx in [
                    entry.src_pos,
                    entry.src_neg,
                    entry.sense_pos,
                    entry.sense_neg,
                ] {
                    assert!(idx < n);
                }
            }
        }
    }

    #[test]
    fn no_exclusion_keeps_full_table() {
        let protocol = Protocol::create(16, 1, 1, ExclusionPolicy::None).unwrap();
        assert_eq!(protocol.len(), 256);
        assert_eq!(protocol.keep_mask().count_ones(..), 256);
        assert_eq!(protocol.entries()[0].as_tuple(), (0, 1, 1, 0));
    }

    #[test]
    fn fixed_start_has_same_entries_in_other_order() {
        let rotating = Protocol::create(16, 1, 1, ExclusionPolicy::ExcludeAdjacent).unwrap();
        let fixed = Protocol::create_with_start(
            16,
            1,
            1,
            ExclusionPolicy::ExcludeAdjacent,
            MeasurementStart::Fixed,
        )
        .unwrap();
        assert_eq!(fixed.len(), rotating.len());
        // for excitation (2, 3) the rotating walk starts at 4, the fixed one at 0
        assert_eq!(rotating.entries()[26].as_tuple(), (2, 3, 5, 4));
        assert_eq!(fixed.entries()[26].as_tuple(), (2, 3, 1, 0));

        let mut a: Vec<_> = rotating.entries().iter().map(|e| e.as_tuple()).collect();
        let mut b: Vec<_> = fixed.entries().iter().map(|e| e.as_tuple()).collect();
        a.sort_unstable();
        b.sort_unstable();
        assert_eq!(a, b);
    }

    #[test]
    fn excitation_indices_match_entries() {
        let protocol = Protocol::create(8, 2, 1, ExclusionPolicy::ExcludeAdjacent).unwrap();
        for (entry, &exc) in protocol.entries().iter().zip(protocol.excitation_of_entry()) {
            assert_eq!((entry.src_pos, entry.src_neg), protocol.excitations()[exc]);
        }
    }

    #[test]
    fn reduce_full_frame_selects_kept_entries() {
        let protocol = Protocol::create(16, 1, 1, ExclusionPolicy::ExcludeAdjacent).unwrap();
        let full: Vec<f64> = (0..256).map(|i| i as f64).collect();
        let reduced = protocol.reduce_full_frame(&full).unwrap();
        assert_eq!(reduced.len(), 208);
        // first excitation drops walk positions 0, 1 and 15
        assert_eq!(reduced[0], 2.0);
        assert_eq!(reduced[12], 14.0);
        assert_eq!(reduced[13], 18.0);
        assert!(protocol.reduce_full_frame(&full[..200]).is_none());
    }

    #[test]
    fn invalid_parameters() {
        use InvalidProtocolError::*;
        let policy = ExclusionPolicy::ExcludeAdjacent;
        assert_eq!(Protocol::create(1, 1, 1, policy), Err(TooFewElectrodes(1)));
        assert!(matches!(
            Protocol::create(16, 16, 1, policy),
            Err(DegenerateExcitation { stride: 16, .. })
        ));
        assert!(matches!(
            Protocol::create(16, 1, 0, policy),
            Err(DegenerateMeasurement { stride: 0, .. })
        ));
        // with three electrodes every sense pair touches a source
        assert_eq!(Protocol::create(3, 1, 1, policy), Err(NoMeasurements));
    }
}
