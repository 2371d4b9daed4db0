//! Batches of segments.
use super::{PolicyInfo, Segment, SegmentId};
use anyhow::{bail, Result};
use ndarray::{Array2, Array3};

/// Segments stacked along a leading batch axis, `[batch_size, seq_length, ...]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    /// Observations, `[batch_size, seq_length, obs_dim]`.
    pub obs: Array3<f32>,

    /// Actions.
    pub act: Array2<u32>,

    /// Rewards.
    pub rew: Array2<f32>,

    /// Termination flags as 0 or 1.
    pub end: Array2<u8>,

    /// Truncation flags as 0 or 1.
    pub trunc: Array2<u8>,

    /// Policy metadata.
    pub info: Array2<PolicyInfo>,

    /// `true` for real steps, `false` for padding.
    pub mask_padding: Array2<bool>,

    /// Where each segment was taken from.
    pub segment_ids: Vec<SegmentId>,
}

impl Batch {
    /// Stacks segments of equal length and observation dimension.
    pub fn collate(segments: &[Segment]) -> Result<Self> {
        let first = match segments.first() {
            Some(s) => s,
            None => bail!("Cannot collate an empty list of segments"),
        };
        let (b, l) = (segments.len(), first.len());
        let d = first.obs.first().map(|o| o.len()).unwrap_or(0);
        if let Some(s) = segments
            .iter()
            .find(|s| s.len() != l || s.obs.iter().any(|o| o.len() != d))
        {
            bail!("Segment {:?} does not match the shape [{}, {}] of the batch", s.id, l, d);
        }

        let obs: Vec<f32> = segments
            .iter()
            .flat_map(|s| s.obs.iter().flatten().copied())
            .collect();
        let act: Vec<u32> = segments.iter().flat_map(|s| s.act.iter().copied()).collect();
        let rew: Vec<f32> = segments.iter().flat_map(|s| s.rew.iter().copied()).collect();
        let info: Vec<PolicyInfo> = segments.iter().flat_map(|s| s.info.iter().copied()).collect();
        let mask_padding: Vec<bool> = segments
            .iter()
            .flat_map(|s| s.mask_padding.iter().copied())
            .collect();

        Ok(Self {
            obs: Array3::from_shape_vec((b, l, d), obs)?,
            act: Array2::from_shape_vec((b, l), act)?,
            rew: Array2::from_shape_vec((b, l), rew)?,
            end: Array2::from_shape_vec((b, l), flags(segments, |s| &s.end))?,
            trunc: Array2::from_shape_vec((b, l), flags(segments, |s| &s.trunc))?,
            info: Array2::from_shape_vec((b, l), info)?,
            mask_padding: Array2::from_shape_vec((b, l), mask_padding)?,
            segment_ids: segments.iter().map(|s| s.id).collect(),
        })
    }

    /// The number of segments.
    pub fn batch_size(&self) -> usize {
        self.act.nrows()
    }

    /// Length of segments.
    pub fn seq_length(&self) -> usize {
        self.act.ncols()
    }

    /// The number of real (non-padded) steps.
    pub fn num_real_steps(&self) -> usize {
        self.mask_padding.iter().filter(|m| **m).count()
    }
}

fn flags(segments: &[Segment], f: fn(&Segment) -> &Vec<bool>) -> Vec<u8> {
    segments
        .iter()
        .flat_map(|s| f(s).iter().map(|x| *x as u8))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dataset::EpisodeStore, dummy::episode_from_rewards};

    #[test]
    fn test_collate() -> Result<()> {
        let mut store = EpisodeStore::new("unused", "train_dataset", 1);
        let mut episode = episode_from_rewards(&[0.0, 1.0, 0.0], true);
        episode.info[2] = PolicyInfo {
            epsilon: 0.1,
            is_random: true,
        };
        store.append(episode);
        store.append(episode_from_rewards(&[0.0, -1.0, 0.0, 0.0, 1.0], true));
        let segments = vec![
            store.sample_segment(0, 1, 4, true)?,
            store.sample_segment(1, 0, 4, false)?,
        ];

        let batch = Batch::collate(&segments)?;
        assert_eq!(batch.obs.shape(), &[2, 4, 2]);
        assert_eq!((batch.batch_size(), batch.seq_length()), (2, 4));
        assert_eq!(batch.rew.row(0).to_vec(), vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(batch.end.row(0).to_vec(), vec![0, 1, 0, 0]);
        assert_eq!(batch.act[[0, 3]], 1);
        assert!(batch.info[[0, 1]].is_random);
        assert_eq!(batch.info[[0, 1]].epsilon, 0.1);
        assert_eq!(batch.info[[0, 3]], PolicyInfo::default());
        assert_eq!(batch.num_real_steps(), 6);
        assert_eq!(batch.segment_ids[1], SegmentId::new(1, 0, 4));
        Ok(())
    }

    #[test]
    fn test_collate_mismatched_lengths() -> Result<()> {
        let mut store = EpisodeStore::new("unused", "train_dataset", 0);
        store.append(episode_from_rewards(&[0.0; 6], true));
        let segments = vec![store.sample_segment(0, 0, 3, false)?, store.sample_segment(0, 0, 4, false)?];
        assert!(Batch::collate(&segments).is_err());
        assert!(Batch::collate(&[]).is_err());
        Ok(())
    }
}
