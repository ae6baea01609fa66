// Integration tests for the lowattr driver: argument handling, output formats
// and exit codes.

use std::path::PathBuf;
use std::process::Command;

use lowattr::id::ValueRef;
use lowattr::mapping::MappingExpr::Dim;
use lowattr::program::{
    BufferAttr, DomainDim, LoopAttr, MemorySpace, Module, NamedMapping, Operation, Program,
};

fn lowattr_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_lowattr"))
}

/// Write `contents` to a fresh file under the system temp directory.
fn temp_file(name: &str, contents: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lowattr-cli-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("failed to create temp dir");
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("failed to write temp file");
    path
}

fn chain_module() -> Module {
    let mut p = Program::new("chain");
    let a = p.add(Operation::compute(vec![DomainDim::new("N")]).with_name("A"));
    p.add(
        Operation::compute(vec![DomainDim::new("N")])
            .with_name("B")
            .with_operand(ValueRef::new(a, 0), vec![Dim(0)]),
    );
    Module { programs: vec![p] }
}

fn write_module(name: &str, module: &Module) -> PathBuf {
    temp_file(name, &serde_json::to_string(module).expect("module serializes"))
}

#[test]
fn json_output_carries_inferred_attributes() {
    let input = write_module("chain.json", &chain_module());
    let output = Command::new(lowattr_binary())
        .arg(&input)
        .output()
        .expect("failed to run lowattr");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let module: Module = serde_json::from_slice(&output.stdout).expect("stdout is a module");
    let program = &module.programs[0];
    for op in &program.ops {
        assert!(op.sequence.is_some());
        assert!(op.loop_nest.is_some());
    }
    let stored = program.ops[0].storage_attr(0).expect("A has a storage");
    assert_eq!(stored.space, MemorySpace::Memory);
    assert_eq!(stored.name.as_deref(), Some("buffer_0"));
}

#[test]
fn summary_output_to_file() {
    let input = write_module("summary.json", &chain_module());
    let out = input.with_extension("txt");
    let status = Command::new(lowattr_binary())
        .arg(&input)
        .arg("--emit")
        .arg("summary")
        .arg("-o")
        .arg(&out)
        .status()
        .expect("failed to run lowattr");
    assert!(status.success());
    let text = std::fs::read_to_string(&out).expect("output written");
    assert!(text.starts_with("program chain\n"));
    assert!(text.contains("%0#0 memory buffer_0 (loop_0) -> (d0)"));
}

#[test]
fn stop_after_sequence_writes_only_sequence() {
    let input = write_module("stop.json", &chain_module());
    let output = Command::new(lowattr_binary())
        .arg(&input)
        .arg("--stop-after")
        .arg("sequence")
        .output()
        .expect("failed to run lowattr");
    assert!(output.status.success());
    let module: Module = serde_json::from_slice(&output.stdout).expect("stdout is a module");
    for op in &module.programs[0].ops {
        assert!(op.sequence.is_some());
        assert!(op.loop_nest.is_none());
        assert!(op.storage.is_empty());
    }
}

#[test]
fn verbose_prints_pass_timings() {
    let input = write_module("verbose.json", &chain_module());
    let output = Command::new(lowattr_binary())
        .arg(&input)
        .arg("--verbose")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run lowattr");
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    for pass in ["default_sequence", "default_loop_nest", "default_storage"] {
        assert!(
            stderr.contains(&format!("lowattr: {} complete", pass)),
            "missing timing for {}:\n{}",
            pass,
            stderr
        );
    }
    // Analyses log at debug level once --verbose is given.
    assert!(stderr.contains("loop fusion of chain"), "stderr: {}", stderr);
}

#[test]
fn quiet_run_logs_nothing() {
    let input = write_module("quiet.json", &chain_module());
    let output = Command::new(lowattr_binary())
        .arg(&input)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run lowattr");
    assert!(output.status.success());
    assert!(output.stderr.is_empty(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
}

#[test]
fn pipeline_errors_exit_with_one() {
    let mut module = chain_module();
    module.programs[0].ops[0].loop_nest = Some(vec![LoopAttr::new("i", Dim(0))]);
    module.programs[0].ops[1].loop_nest = Some(vec![LoopAttr::new("i", Dim(0))]);
    module.programs[0].ops[0].sequence = Some(1);
    module.programs[0].ops[1].sequence = Some(0);
    module.programs[0].ops[0].storage = vec![Some(BufferAttr {
        space: MemorySpace::Memory,
        name: Some("buf".into()),
        layout: Some(NamedMapping {
            names: vec!["i".into()],
            exprs: vec![Dim(0)],
        }),
    })];
    let input = write_module("hazard.json", &module);
    let output = Command::new(lowattr_binary())
        .arg(&input)
        .output()
        .expect("failed to run lowattr");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error[E0400]"), "stderr: {}", stderr);
    assert!(stderr.contains("error[E0402]"), "stderr: {}", stderr);
    assert!(output.stdout.is_empty());
}

#[test]
fn malformed_input_exits_with_two() {
    let input = temp_file("broken.json", "{ not json");
    let output = Command::new(lowattr_binary())
        .arg(&input)
        .output()
        .expect("failed to run lowattr");
    assert_eq!(output.status.code(), Some(2));

    let missing = std::env::temp_dir().join("lowattr-cli-does-not-exist.json");
    let output = Command::new(lowattr_binary())
        .arg(&missing)
        .output()
        .expect("failed to run lowattr");
    assert_eq!(output.status.code(), Some(2));
}
