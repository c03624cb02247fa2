use std::collections::BTreeMap;
use std::time::Duration;

use clap::Parser;
use stevedore::api::ApiClient;
use stevedore::model::{AllocStatus, JobSpec};

#[derive(Parser, Debug)]
#[command(name = "dispatch-job")]
#[command(about = "Register a parameterized batch job, dispatch it and follow the allocation")]
struct Args {
    /// Control API address of any agent
    #[arg(long, default_value = "127.0.0.1:4646")]
    addr: String,

    /// Value for the MODEL_NAME meta key
    #[arg(long, default_value = "exp-1")]
    model: String,

    /// Give up following the allocation after this many seconds
    #[arg(long, default_value = "60")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let client = ApiClient::new(&args.addr);

    let template: JobSpec = serde_json::from_value(serde_json::json!({
        "id": "train",
        "type": "batch",
        "task": {
            "driver": "exec",
            "command": "sh",
            "args": ["-c", "echo training $MODEL_NAME; sleep 2"],
            "resources": { "cpu": 250, "memory_mb": 128 }
        },
        "restart": { "attempts": 3, "interval": "5m", "delay": "25s", "mode": "delay" },
        "parameterized": {
            "meta_required": ["MODEL_NAME"],
            "validation": {
                "MODEL_NAME": { "pattern": "^[a-z0-9-]+$", "max_length": 32 }
            }
        }
    }))?;
    let registered = client.submit_job(&template, None).await?;
    println!("Registered template {} at index {}", registered.job_id, registered.index);

    // A dispatch without the required key is rejected before anything is scheduled.
    match client.dispatch("train", BTreeMap::new(), None).await {
        Ok(resp) => println!("Unexpectedly dispatched {}", resp.job_id),
        Err(e) => println!("Dispatch without MODEL_NAME rejected: {}", e),
    }

    let meta = BTreeMap::from([("MODEL_NAME".to_string(), args.model.clone())]);
    let dispatched = client.dispatch("train", meta, None).await?;
    println!("Dispatched {}", dispatched.job_id);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);
    loop {
        let allocs = client.allocations(&dispatched.job_id).await?;
        for alloc in &allocs {
            println!(
                "  alloc {} on node {}: {}",
                alloc.id, alloc.node_id, alloc.status
            );
        }
        if allocs
            .iter()
            .any(|a| matches!(a.status, AllocStatus::Complete | AllocStatus::Failed))
        {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            println!("Gave up waiting for the allocation");
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let job = client.job(&dispatched.job_id).await?;
    println!("Job {} is {}", job.spec.id, job.status);
    Ok(())
}
