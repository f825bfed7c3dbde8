use ndarray::ArrayView1;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("{folds}-fold cross-validation needs at least {folds} subjects, found {subjects}")]
    TooFewSubjects { subjects: usize, folds: usize },
    #[error("cross-validation needs at least 2 folds, got {0}")]
    TooFewFolds(usize),
    #[error("cannot resample an empty sample")]
    Empty,
}

/// Subject indices used to fit (`train`) and to evaluate (`test`) one model refit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Independent, reproducible stream for one repetition.
pub fn repetition_rng(seed: u64, repetition: usize) -> StdRng {
    // splitmix64 finalizer
    let mut z = seed ^ (repetition as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    StdRng::seed_from_u64(z ^ (z >> 31))
}

fn check_folds(subjects: usize, folds: usize) -> Result<(), ResampleError> {
    if folds < 2 {
        return Err(ResampleError::TooFewFolds(folds));
    }
    if subjects < folds {
        return Err(ResampleError::TooFewSubjects { subjects, folds });
    }
    Ok(())
}

fn partitions_from_labels(labels: &[usize], folds: usize) -> Vec<Partition> {
    (0..folds)
        .map(|fold| {
            let (test, train): (Vec<usize>, Vec<usize>) =
                (0..labels.len()).partition(|&i| labels[i] == fold);
            Partition { train, test }
        })
        .collect()
}

/// Random k-fold split: every subject lands in exactly one test fold.
pub fn k_fold<R: Rng>(subjects: usize, folds: usize, rng: &mut R) -> Result<Vec<Partition>, ResampleError> {
    check_folds(subjects, folds)?;
    let mut order: Vec<usize> = (0..subjects).collect();
    order.shuffle(rng);
    let mut labels = vec![0; subjects];
    for (position, &subject) in order.iter().enumerate() {
        labels[subject] = position % folds;
    }
    Ok(partitions_from_labels(&labels, folds))
}

/// Type 7 sample quantile of sorted data.
fn quantile(sorted: &[f64], prob: f64) -> f64 {
    let h = (sorted.len() - 1) as f64 * prob;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// k-fold split balanced over quantile bins of `time`.
///
/// The number of bins is `n / folds` clamped to `2..=5`. Members of each bin are
/// shuffled and dealt to folds in turn, so every fold sees a similar spread of times.
pub fn stratified_k_fold<R: Rng>(
    time: ArrayView1<'_, f64>,
    folds: usize,
    rng: &mut R,
) -> Result<Vec<Partition>, ResampleError> {
    let subjects = time.len();
    check_folds(subjects, folds)?;

    let mut sorted = time.to_vec();
    sorted.sort_by(f64::total_cmp);
    let bins = (subjects / folds).clamp(2, 5);
    let mut breaks: Vec<f64> = (0..=bins)
        .map(|j| quantile(&sorted, j as f64 / bins as f64))
        .collect();
    breaks.dedup();
    let interior = &breaks[1..breaks.len().saturating_sub(1).max(1)];

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); interior.len() + 1];
    for (subject, &t) in time.iter().enumerate() {
        members[interior.partition_point(|&b| b < t)].push(subject);
    }

    let mut fold_order: Vec<usize> = (0..folds).collect();
    fold_order.shuffle(rng);
    let mut labels = vec![0; subjects];
    let mut position = 0;
    for bin in members.iter_mut() {
        bin.shuffle(rng);
        for &subject in bin.iter() {
            labels[subject] = fold_order[position % folds];
            position += 1;
        }
    }
    Ok(partitions_from_labels(&labels, folds))
}

/// With-replacement draw of size `n`; the out-of-bag subjects form the test set.
pub fn bootstrap<R: Rng>(subjects: usize, rng: &mut R) -> Result<Partition, ResampleError> {
    if subjects == 0 {
        return Err(ResampleError::Empty);
    }
    let mut in_bag = vec![false; subjects];
    let train: Vec<usize> = (0..subjects)
        .map(|_| {
            let pick = rng.gen_range(0..subjects);
            in_bag[pick] = true;
            pick
        })
        .collect();
    let test = (0..subjects).filter(|&i| !in_bag[i]).collect();
    Ok(Partition { train, test })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn assert_is_partition(partitions: &[Partition], subjects: usize) {
        let mut seen = vec![0usize; subjects];
        for partition in partitions {
            for &i in &partition.test {
                seen[i] += 1;
            }
            assert_eq!(partition.train.len() + partition.test.len(), subjects);
            for &i in &partition.train {
                assert!(!partition.test.contains(&i));
            }
        }
        assert!(seen.iter().all(|&count| count == 1));
    }

    #[test]
    fn k_fold_partitions_every_subject_once() {
        let mut rng = repetition_rng(7, 0);
        let folds = k_fold(23, 10, &mut rng).expect("folds");
        assert_eq!(folds.len(), 10);
        assert_is_partition(&folds, 23);
        assert!(folds.iter().all(|p| p.test.len() == 2 || p.test.len() == 3));
    }

    #[test]
    fn stratified_folds_spread_each_time_bin() {
        let time = Array1::from_iter((0..50).map(|i| i as f64 + 0.5));
        let mut rng = repetition_rng(11, 3);
        let folds = stratified_k_fold(time.view(), 10, &mut rng).expect("folds");
        assert_is_partition(&folds, 50);
        // Five bins of ten subjects: every fold holds one subject per bin.
        for partition in &folds {
            let mut bins: Vec<usize> = partition.test.iter().map(|&i| i / 10).collect();
            bins.sort_unstable();
            assert_eq!(bins, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn stratified_folds_handle_constant_time() {
        let time = Array1::from_elem(12, 44.0);
        let mut rng = repetition_rng(1, 1);
        let folds = stratified_k_fold(time.view(), 3, &mut rng).expect("folds");
        assert_is_partition(&folds, 12);
    }

    #[test]
    fn bootstrap_test_set_is_out_of_bag() {
        let mut rng = repetition_rng(5, 9);
        let draw = bootstrap(40, &mut rng).expect("draw");
        assert_eq!(draw.train.len(), 40);
        for i in &draw.test {
            assert!(!draw.train.contains(i));
        }
        for i in 0..40 {
            assert!(draw.train.contains(&i) || draw.test.contains(&i));
        }
    }

    #[test]
    fn same_seed_and_repetition_reproduce_folds() {
        let a = k_fold(30, 10, &mut repetition_rng(42, 5)).expect("folds");
        let b = k_fold(30, 10, &mut repetition_rng(42, 5)).expect("folds");
        let c = k_fold(30, 10, &mut repetition_rng(42, 6)).expect("folds");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn too_few_subjects_is_rejected() {
        let mut rng = repetition_rng(0, 0);
        assert!(matches!(
            k_fold(5, 10, &mut rng),
            Err(ResampleError::TooFewSubjects { subjects: 5, folds: 10 })
        ));
    }
}
