use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use vent_core::{BreathController, VentilationMode};

// Pressure trace of one breath: rise to the plateau, then decay to PEEP
fn breath_trace(ticks: u32, ticks_per_inhalation: u32) -> Vec<i16> {
    (0..ticks)
        .map(|t| {
            if t < ticks_per_inhalation {
                let rise = 200.0 * (1.0 - (-(t as f32) / 15.0).exp());
                rise as i16
            } else {
                let t = (t - ticks_per_inhalation) as f32;
                (50.0 + 150.0 * (-t / 20.0).exp()) as i16
            }
        })
        .collect()
}

pub fn bench_breath(c: &mut Criterion) {
    let mut g = c.benchmark_group("breath");
    //   BENCH_SAMPLE_SIZE=10 BENCH_MEAS_MS=50 cargo bench -p vent_core --bench tick
    if let Ok(ss) = std::env::var("BENCH_SAMPLE_SIZE") {
        if let Ok(n) = ss.parse::<usize>() {
            g.sample_size(n.max(1));
        }
    } else {
        g.sample_size(50);
    }
    if let Ok(ms) = std::env::var("BENCH_MEAS_MS")
        && let Ok(ms_u64) = ms.parse::<u64>()
    {
        g.measurement_time(std::time::Duration::from_millis(ms_u64));
    }

    for mode in [
        VentilationMode::PcCmv,
        VentilationMode::PcBipap,
        VentilationMode::VcCmv,
    ] {
        g.bench_function(format!("cycle_{mode}"), |b| {
            b.iter_batched(
                || {
                    let mut c = BreathController::default();
                    c.on_ventilation_mode_set(mode);
                    c.setup();
                    c.init_respiratory_cycle();
                    let trace = breath_trace(c.ticks_per_cycle(), c.ticks_per_inhalation());
                    (c, trace)
                },
                |(mut c, trace)| {
                    for (tick, p) in (0u32..).zip(trace) {
                        c.update_pressure(black_box(p));
                        c.compute(tick);
                    }
                    c.end_respiratory_cycle(3000);
                    black_box(c.plateau_pressure());
                },
                BatchSize::SmallInput,
            )
        });
    }
    g.finish();
}

criterion_group!(tick, bench_breath);
criterion_main!(tick);
