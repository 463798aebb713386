// Trace overhead benchmark
// Measures end-to-end session latency for trivial tracees, next to the same
// program run untraced, so the cost of the stop-check-resume loop is visible

use std::process::Command;
use std::time::{Duration, Instant};
use tracebox::{Entry, Policy, TraceSession, TraceStatus};

/// Benchmark configuration
const ITERATIONS: usize = 100;
const WARMUP_ITERATIONS: usize = 10;

/// Latency percentiles
struct LatencyStats {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    min: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();

        let p50_idx = (len as f64 * 0.50) as usize;
        let p95_idx = (len as f64 * 0.95) as usize;
        let p99_idx = (len as f64 * 0.99) as usize;

        let sum: Duration = samples.iter().sum();
        let mean = sum / len as u32;

        Self {
            p50: samples[p50_idx],
            p95: samples[p95_idx],
            p99: samples[p99_idx],
            min: samples[0],
            max: samples[len - 1],
            mean,
        }
    }

    fn print(&self, label: &str) {
        println!("\n{}", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  p99: {:?}", self.p99);
        println!("  min: {:?}", self.min);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

/// Benchmark result
struct BenchmarkResult {
    scenario: String,
    baseline: LatencyStats,
    traced: LatencyStats,
    passed: bool,
    reason: Option<String>,
}

impl BenchmarkResult {
    fn print(&self) {
        println!("\n=== {} ===", self.scenario);
        self.baseline.print("Untraced");
        self.traced.print("Traced");

        match &self.reason {
            None => println!("PASS"),
            Some(reason) => println!("FAIL: {}", reason),
        }
    }
}

fn entry(argv: &[&str]) -> Entry {
    let mut entry = Entry::new(argv[0], argv.iter().map(|a| a.to_string()).collect());
    entry.cwd = "/".into();
    entry.stdio = [0, 2, 2];
    entry
}

/// Why a traced run produced no sample
enum Skip {
    /// The host forbids or lacks ptrace
    Unavailable(String),
    /// The session ran but did not end cleanly
    Failed(String),
}

fn traced_once(argv: &[&str]) -> Result<Duration, Skip> {
    let mut session =
        TraceSession::ptrace(Policy::default()).map_err(|e| Skip::Failed(e.to_string()))?;
    let start = Instant::now();
    let result = session
        .run(&entry(argv))
        .map_err(|e| Skip::Failed(e.to_string()))?;
    let elapsed = start.elapsed();

    match result.status {
        TraceStatus::Ok => Ok(elapsed),
        TraceStatus::TracerErr => {
            let message = result.message.unwrap_or_default();
            if message.contains("EPERM") || message.contains("ENOSYS") {
                Err(Skip::Unavailable(message))
            } else {
                Err(Skip::Failed(message))
            }
        }
        status => Err(Skip::Failed(format!(
            "{:?} {:?} (epid={:?})",
            status, result.violation, result.epid
        ))),
    }
}

fn untraced_once(argv: &[&str]) -> Duration {
    let start = Instant::now();
    let _ = Command::new(argv[0]).args(&argv[1..]).output();
    start.elapsed()
}

/// Compare traced and untraced latency; the traced p50 must stay within
/// `budget` of the untraced p50.
fn benchmark(scenario: &str, argv: &[&str], budget: Duration) -> Result<BenchmarkResult, Skip> {
    for _ in 0..WARMUP_ITERATIONS {
        traced_once(argv)?;
        let _ = untraced_once(argv);
    }

    let mut baseline = Vec::with_capacity(ITERATIONS);
    let mut traced = Vec::with_capacity(ITERATIONS);
    for _ in 0..ITERATIONS {
        baseline.push(untraced_once(argv));
        traced.push(traced_once(argv)?);
    }

    let baseline = LatencyStats::from_samples(baseline);
    let traced = LatencyStats::from_samples(traced);
    let overhead = traced.p50.saturating_sub(baseline.p50);
    let passed = overhead < budget;
    let reason = (!passed).then(|| format!("p50 overhead {:?} (target <{:?})", overhead, budget));

    Ok(BenchmarkResult {
        scenario: scenario.to_string(),
        baseline,
        traced,
        passed,
        reason,
    })
}

fn main() {
    let _ = env_logger::builder().try_init();
    println!("=== tracebox Trace Overhead Benchmark ===");
    println!("Iterations: {} (after {} warmup)", ITERATIONS, WARMUP_ITERATIONS);

    let scenarios: [(&str, &[&str], Duration); 3] = [
        ("true", &["/bin/true"], Duration::from_millis(20)),
        (
            "shell fork+exec",
            &["/bin/sh", "-c", "/bin/true; /bin/true"],
            Duration::from_millis(50),
        ),
        (
            "syscall heavy",
            &["/bin/sh", "-c", "i=0; while [ $i -lt 200 ]; do echo $i; i=$((i+1)); done"],
            Duration::from_millis(100),
        ),
    ];

    let mut results = Vec::new();
    for (name, argv, budget) in scenarios {
        match benchmark(name, argv, budget) {
            Ok(result) => results.push(result),
            Err(Skip::Unavailable(reason)) => {
                println!("Tracing unavailable on this host, skipping benchmark: {}", reason);
                return;
            }
            Err(Skip::Failed(reason)) => {
                println!("\n=== {} ===\nFAIL: traced run did not finish cleanly: {}", name, reason);
                std::process::exit(1);
            }
        }
    }

    for result in &results {
        result.print();
    }

    let passed_count = results.iter().filter(|r| r.passed).count();
    let total_count = results.len();

    println!("\n=== Summary ===");
    println!("{}/{} scenarios within overhead budget", passed_count, total_count);

    if passed_count != total_count {
        std::process::exit(1);
    }
}
