use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, Normal};
use rearrest::cox::{ModelVariant, NewtonOptions, TieMethod, fit_cox};
use rearrest::data::{OutcomeData, OutcomeKind, SubjectTable};

/// Whole-month follow-up, so the event times carry realistic ties.
fn simulated_outcome(n: usize) -> OutcomeData {
    let mut rng = StdRng::seed_from_u64(0x5EED_C0C5 + n as u64);
    let noise = Normal::new(0.0, 1.0).expect("valid normal");
    let mut release_age = Vec::with_capacity(n);
    let mut dacc = Vec::with_capacity(n);
    let mut time = Vec::with_capacity(n);
    let mut event = Vec::with_capacity(n);
    for _ in 0..n {
        let age = rng.gen_range(18.0..60.0);
        let activity = noise.sample(&mut rng);
        let rate = 0.03 * (-0.03 * (age - 35.0) - 0.5 * activity).exp();
        let failure = Exp::new(rate).expect("positive rate").sample(&mut rng);
        let censoring = rng.gen_range(6.0..48.0);
        release_age.push(age);
        dacc.push(activity);
        time.push(failure.min(censoring).ceil().max(1.0));
        event.push(failure <= censoring);
    }
    SubjectTable::from_columns(release_age, dacc, None, Some((time, event)), None)
        .and_then(|table| table.outcome(OutcomeKind::Violent))
        .expect("simulated table")
}

fn benchmark_cox_fit(c: &mut Criterion) {
    let sizes = [100_usize, 400, 1600];
    let samples: Vec<_> = sizes
        .iter()
        .map(|&size| (size, simulated_outcome(size)))
        .collect();

    let mut group = c.benchmark_group("cox_fit");
    for (size, data) in samples.iter() {
        group.throughput(Throughput::Elements(*size as u64));
        for ties in [TieMethod::Efron, TieMethod::Breslow] {
            let options = NewtonOptions {
                ties,
                ..NewtonOptions::default()
            };
            group.bench_with_input(
                BenchmarkId::new(format!("{ties:?}"), size),
                data,
                |b, input| {
                    b.iter(|| {
                        let fit = fit_cox(black_box(input), ModelVariant::AgeDacc, &options)
                            .expect("simulated fit converges");
                        black_box(fit);
                    });
                },
            );
        }
    }
    group.finish();
}

criterion_group!(cox_fit, benchmark_cox_fit);
criterion_main!(cox_fit);
