use stress_test::{
    stress_test_orset, stress_test_pncounter, stress_test_readers, stress_test_scaling, HarnessResult,
};
use tracing_subscriber::EnvFilter;

fn main() -> HarnessResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> HarnessResult<()> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            ASYNC STRESS TESTS                               ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut all_converged = true;

    // Test 1: OR-Set with small scale
    let stats = stress_test_orset(4, 100, 200).await?;
    stats.print();
    all_converged &= stats.converged;

    // Test 2: PN-Counter with small scale
    let stats = stress_test_pncounter(4, 100, 200).await?;
    stats.print();
    all_converged &= stats.converged;

    // Test 3: OR-Set with medium scale
    let stats = stress_test_orset(10, 500, 1000).await?;
    stats.print();
    all_converged &= stats.converged;

    // Test 4: readers racing a growing G-Set
    let stats = stress_test_readers(4, 20_000).await?;
    stats.print();
    all_converged &= stats.converged;

    // Test 5: Scaling analysis
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS (OR-Set)                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    stress_test_scaling(20, 4).await?;

    if !all_converged {
        return Err("at least one stress run failed to converge".into());
    }
    println!("\n✓ All stress tests completed successfully!");
    Ok(())
}
