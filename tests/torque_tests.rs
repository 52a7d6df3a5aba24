use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use gridflow::batch::{BatchAdapter, BatchJobId, CommandRunner, JobRequest, TorqueAdapter};
use gridflow::config::{TorqueConfig, TorqueFlavor};
use gridflow::error::{GridflowError, Result};

type Responder = Box<dyn Fn(&[String]) -> Result<String> + Send + Sync>;

/// Records every command line and answers with a scripted response.
struct FakeRunner {
    calls: Mutex<Vec<Vec<String>>>,
    respond: Responder,
}

impl FakeRunner {
    fn new(respond: impl Fn(&[String]) -> Result<String> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    fn replying(stdout: &'static str) -> Arc<Self> {
        Self::new(move |_| Ok(stdout.to_string()))
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, argv: &[String]) -> Result<String> {
        self.calls.lock().unwrap().push(argv.to_vec());
        (self.respond)(argv)
    }
}

fn failed(argv: &[String], stderr: &str) -> GridflowError {
    GridflowError::CommandFailed {
        command: argv.join(" "),
        code: Some(153),
        stderr: stderr.to_string(),
    }
}

async fn adapter(runner: &Arc<FakeRunner>, config: TorqueConfig) -> TorqueAdapter {
    TorqueAdapter::new(runner.clone(), config).await
}

fn arg_after<'a>(line: &'a [String], flag: &str) -> Option<&'a str> {
    line.iter()
        .position(|a| a == flag)
        .and_then(|i| line.get(i + 1))
        .map(String::as_str)
}

// =============================================================================
// Flavour Detection
// =============================================================================

#[tokio::test]
async fn test_detects_pbs_pro() {
    let runner = FakeRunner::replying("pbs_version = PBSPro_13.1.0\n");
    let torque = adapter(&runner, TorqueConfig::default()).await;

    assert_eq!(torque.flavor(), TorqueFlavor::Pro);
    assert_eq!(runner.calls(), vec![vec!["pbsnodes", "--version"]]);
}

#[tokio::test]
async fn test_detects_open_source_torque() {
    let runner = FakeRunner::replying("Version: 6.1.2\n");
    let torque = adapter(&runner, TorqueConfig::default()).await;
    assert_eq!(torque.flavor(), TorqueFlavor::Oss);
}

#[tokio::test]
async fn test_detection_failure_assumes_open_source() {
    let runner = FakeRunner::new(|argv| Err(failed(argv, "pbsnodes: command not found")));
    let torque = adapter(&runner, TorqueConfig::default()).await;
    assert_eq!(torque.flavor(), TorqueFlavor::Oss);
}

#[tokio::test]
async fn test_forced_flavor_skips_probe() {
    let runner = FakeRunner::replying("");
    let torque = adapter(&runner, TorqueConfig::default().with_flavor(TorqueFlavor::Pro)).await;

    assert_eq!(torque.flavor(), TorqueFlavor::Pro);
    assert!(runner.calls().is_empty());
}

// =============================================================================
// Submission
// =============================================================================

#[tokio::test]
async fn test_oss_submission_line() {
    let logs = tempfile::tempdir().unwrap();
    let runner = FakeRunner::replying("");
    let torque = adapter(&runner, TorqueConfig::default().with_flavor(TorqueFlavor::Oss)).await;

    let request = JobRequest::new("align", "bwa mem ref.fa reads.fq")
        .with_cpu(3.5)
        .with_memory(4 * 1024 * 1024 * 1024)
        .with_env("SAMPLE", "a b");
    let line = torque.prepare_submission(7, &request, logs.path()).unwrap();

    assert_eq!(&line[..5], &["qsub", "-S", "/bin/sh", "-V", "-N"]);
    assert_eq!(line[5], "gridflow_job_7");
    assert_eq!(arg_after(&line, "-v"), Some("SAMPLE='a b'"));
    assert_eq!(arg_after(&line, "-l"), Some("mem=4194304K,nodes=1:ppn=4"));
    assert!(line.last().unwrap().ends_with(".sh"));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_pro_submission_uses_select() {
    let logs = tempfile::tempdir().unwrap();
    let runner = FakeRunner::replying("");
    let torque = adapter(&runner, TorqueConfig::default().with_flavor(TorqueFlavor::Pro)).await;

    let request = JobRequest::new("train", "python train.py")
        .with_cpu(2.0)
        .with_memory(2 * 1024 * 1024)
        .with_gpus(1);
    let line = torque.prepare_submission(1, &request, logs.path()).unwrap();

    assert_eq!(arg_after(&line, "-l"), Some("select=1:mem=2048K:ncpus=2:ngpus=1"));
    assert_eq!(arg_after(&line, "-v"), None);
}

#[tokio::test]
async fn test_single_cpu_without_memory_requests_nothing() {
    let logs = tempfile::tempdir().unwrap();
    let runner = FakeRunner::replying("");
    let torque = adapter(&runner, TorqueConfig::default().with_flavor(TorqueFlavor::Oss)).await;

    let line = torque
        .prepare_submission(2, &JobRequest::new("tiny", "true"), logs.path())
        .unwrap();
    assert_eq!(arg_after(&line, "-l"), None);
}

#[tokio::test]
async fn test_extra_requests_and_arguments_are_appended() {
    let logs = tempfile::tempdir().unwrap();
    let runner = FakeRunner::replying("");
    let config = TorqueConfig::default()
        .with_flavor(TorqueFlavor::Oss)
        .with_extra_reqs("walltime=01:00:00")
        .with_extra_args("-q long -A 'my project'");
    let torque = adapter(&runner, config).await;

    let request = JobRequest::new("x", "true").with_memory(1024 * 1024);
    let line = torque.prepare_submission(3, &request, logs.path()).unwrap();

    assert_eq!(arg_after(&line, "-l"), Some("mem=1024K,walltime=01:00:00"));
    assert_eq!(arg_after(&line, "-q"), Some("long"));
    assert_eq!(arg_after(&line, "-A"), Some("my project"));
}

#[tokio::test]
async fn test_overriding_reserved_resources_is_rejected() {
    let logs = tempfile::tempdir().unwrap();
    let runner = FakeRunner::replying("");
    let config = TorqueConfig::default()
        .with_flavor(TorqueFlavor::Oss)
        .with_extra_reqs("mem=4gb");
    let torque = adapter(&runner, config).await;

    let err = torque
        .prepare_submission(4, &JobRequest::new("x", "true"), logs.path())
        .unwrap_err();
    assert!(matches!(err, GridflowError::Config(_)));
    assert!(runner.calls().is_empty());

    let config = TorqueConfig::default()
        .with_flavor(TorqueFlavor::Oss)
        .with_extra_args("-l nodes=2:ppn=8");
    let torque = adapter(&runner, config).await;
    assert!(torque
        .prepare_submission(5, &JobRequest::new("x", "true"), logs.path())
        .is_err());
}

#[tokio::test]
async fn test_wrapper_script_contents() {
    let logs = tempfile::tempdir().unwrap();
    let runner = FakeRunner::replying("");
    let torque = adapter(&runner, TorqueConfig::default().with_flavor(TorqueFlavor::Oss)).await;

    let line = torque
        .prepare_submission(9, &JobRequest::new("w", "echo hi > out.txt"), logs.path())
        .unwrap();
    let wrapper = std::path::PathBuf::from(line.last().unwrap());
    assert_eq!(wrapper.parent(), Some(logs.path()));

    let script = std::fs::read_to_string(&wrapper).unwrap();
    let lines: Vec<&str> = script.lines().collect();
    assert_eq!(lines[0], "#!/bin/sh");
    assert!(lines[1].starts_with("#PBS -o "));
    assert!(lines[1].ends_with("gridflow_job_9_batch_torque_${PBS_JOBID}_std_out.log"));
    assert!(lines[2].starts_with("#PBS -e "));
    assert!(lines[2].ends_with("_std_err.log"));
    assert_eq!(lines[3], "cd $PBS_O_WORKDIR");
    assert!(lines.contains(&"echo hi > out.txt"));
}

#[tokio::test]
async fn test_submit_returns_trimmed_id() {
    let runner = FakeRunner::replying("1234.headnode\n");
    let torque = adapter(&runner, TorqueConfig::default().with_flavor(TorqueFlavor::Oss)).await;

    let argv = vec!["qsub".to_string(), "job.sh".to_string()];
    assert_eq!(torque.submit_job(&argv).await.unwrap(), "1234.headnode");
}

#[tokio::test]
async fn test_submit_failure_is_launch_error() {
    let runner = FakeRunner::new(|argv| Err(failed(argv, "qsub: would exceed queue limit")));
    let torque = adapter(&runner, TorqueConfig::default().with_flavor(TorqueFlavor::Oss)).await;

    let argv = vec!["qsub".to_string(), "job.sh".to_string()];
    let err = torque.submit_job(&argv).await.unwrap_err();
    assert!(matches!(err, GridflowError::Launch(_)));

    let silent = FakeRunner::replying("  \n");
    let torque = adapter(&silent, TorqueConfig::default().with_flavor(TorqueFlavor::Oss)).await;
    assert!(matches!(
        torque.submit_job(&argv).await,
        Err(GridflowError::Launch(_))
    ));
}

// =============================================================================
// Status
// =============================================================================

#[tokio::test]
async fn test_running_jobs_use_one_batched_query() {
    let runner = FakeRunner::replying(
        "\
Job ID      Name            User   Time Use S Queue
----------- --------------- ------ -------- - -----
21.head     gridflow_job_1  alice  00:00:30 R batch
22.head     gridflow_job_2  alice  0        Q batch
",
    );
    let torque = adapter(&runner, TorqueConfig::default().with_flavor(TorqueFlavor::Pro)).await;

    let jobs: HashMap<BatchJobId, String> = [(1, "21.head".to_string()), (2, "22.head".to_string())]
        .into_iter()
        .collect();
    let times = torque.get_running_job_ids(&jobs).await.unwrap();

    assert_eq!(runner.calls(), vec![vec!["qstat", "-x", "21", "22"]]);
    assert_eq!(times.len(), 1);
    assert_eq!(times[&1], 30.0);
}

#[tokio::test]
async fn test_exit_code_from_full_status() {
    let runner = FakeRunner::replying("Job Id: 21.head\n    job_state = C\n    exit_status = 2\n");
    let torque = adapter(&runner, TorqueConfig::default().with_flavor(TorqueFlavor::Oss)).await;

    assert_eq!(torque.get_job_exit_code("21.head").await.unwrap(), Some(2));
    assert_eq!(runner.calls(), vec![vec!["qstat", "-f", "21"]]);
}

#[tokio::test]
async fn test_running_job_has_no_exit_code() {
    let runner = FakeRunner::replying("Job Id: 21.head\n    job_state = R\n");
    let torque = adapter(&runner, TorqueConfig::default().with_flavor(TorqueFlavor::Oss)).await;
    assert_eq!(torque.get_job_exit_code("21.head").await.unwrap(), None);
}

#[tokio::test]
async fn test_forgotten_job_counts_as_success() {
    let runner = FakeRunner::new(|argv| Err(failed(argv, "qstat: Unknown Job Id Error 21.head")));
    let torque = adapter(&runner, TorqueConfig::default().with_flavor(TorqueFlavor::Oss)).await;
    assert_eq!(torque.get_job_exit_code("21.head").await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_other_status_errors_propagate() {
    let runner = FakeRunner::new(|argv| Err(failed(argv, "qstat: cannot connect to server")));
    let torque = adapter(&runner, TorqueConfig::default().with_flavor(TorqueFlavor::Oss)).await;
    assert!(matches!(
        torque.get_job_exit_code("21.head").await,
        Err(GridflowError::CommandFailed { .. })
    ));
}

#[tokio::test]
async fn test_kill_uses_qdel() {
    let runner = FakeRunner::replying("");
    let torque = adapter(&runner, TorqueConfig::default().with_flavor(TorqueFlavor::Oss)).await;

    torque.kill_job("21.head").await.unwrap();
    assert_eq!(runner.calls(), vec![vec!["qdel", "21.head"]]);
}
