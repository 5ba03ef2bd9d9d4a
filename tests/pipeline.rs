mod common;

use common::{have, have_bash, CaseFixture};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

const MESH_CALLS: &[&str] = &[
    "surfaceFeatureExtract",
    "blockMesh",
    "decomposePar",
    "snappyHexMesh -overwrite -parallel",
    "reconstructParMesh -constant",
    "checkMesh",
];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

#[test]
fn mesh_and_dispersion_run_in_order_and_archive_results() {
    if !have_bash() {
        return;
    }
    let case = CaseFixture::new();

    let output = case.run(&["-m", "-d"]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let mut expected = strings(MESH_CALLS);
    expected.extend(strings(&[
        "decomposePar",
        "rhoReactingBuoyantFoam -parallel",
        "reconstructPar",
        "foamFormatConvert",
    ]));
    assert_eq!(case.calls(), expected);

    assert_eq!(case.read("save/polyMesh/points"), "points\n");
    assert!(case.path("save/dispersion/H2").is_file());
    assert!(case.read("timeData/system/controlDict").contains("endTime      10;\n"));
    assert!(case
        .read("timeData/system/decomposeParDict")
        .starts_with("numberOfSubdomains    3;\n"));
    assert_eq!(
        case.read("rhoReactingBuoyantFoam/system/decomposeParDict"),
        "numberOfSubdomains 2;\nmethod          scotch;\n"
    );

    let run_log = case.read("log.gdaxs");
    assert!(run_log.contains("Finished checkMesh"));
    assert!(run_log.contains("Finished foamFormatConvert"));
    assert!(case.path("log.blockMesh").is_file());
    assert!(!case.path(".running.rhoReactingBuoyantFoam").exists());
}

#[test]
fn all_stages_transfer_fields_into_combustion() {
    if !have_bash() {
        return;
    }
    let case = CaseFixture::new();

    let output = case.run(&["-a"]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let calls = case.calls();
    assert!(calls.contains(&"reconstructPar -latestTime".to_string()));
    assert!(calls.contains(&"foamFormatConvert -latestTime".to_string()));
    assert_eq!(
        calls.last().map(String::as_str),
        Some("reconstructPar"),
        "combustion reconstructs every time folder"
    );
    assert_eq!(case.read("timeData/1/Tu"), "object    Tu;\n");
    assert_eq!(case.read("timeData/0/ft"), "object    ft;\n");
    assert!(case
        .read("timeData/constant/combustionProperties")
        .contains("    location    (0.7 1.8 1);\n"));
}

#[test]
fn combustion_without_a_dispersion_snapshot_runs_nothing() {
    if !have_bash() {
        return;
    }
    let case = CaseFixture::new();

    let output = case.run(&["-x"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(case.calls().is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("combustion stage needs archived"));
    assert!(!case.path("timeData").exists());
}

#[test]
fn dispersion_failure_stops_before_combustion() {
    if !have_bash() {
        return;
    }
    let case = CaseFixture::new();
    case.fail_solver("rhoReactingBuoyantFoam");

    let output = case.run(&["-m", "-d", "-x"]);
    assert_eq!(output.status.code(), Some(1));

    let calls = case.calls();
    assert_eq!(
        calls.last().map(String::as_str),
        Some("rhoReactingBuoyantFoam -parallel")
    );
    assert!(!calls.iter().any(|call| call.starts_with("XiFoam")));
    assert!(!case.path("save/dispersion").exists());
    assert!(case
        .read("log.gdaxs")
        .contains("Error while executing rhoReactingBuoyantFoam (exit 1)"));
    assert!(!case.path(".running.rhoReactingBuoyantFoam").exists());
}

#[test]
fn clean_removes_generated_state_but_keeps_templates() {
    if !have_bash() {
        return;
    }
    let case = CaseFixture::new();
    let output = case.run(&["-m"]);
    assert!(output.status.success());
    assert!(case.path("save/polyMesh").is_dir());

    let output = case.run(&["-c"]);
    assert!(output.status.success());
    assert!(!case.path("timeData").exists());
    assert!(!case.path("save").exists());
    assert!(!case.path("log.gdaxs").exists());
    assert!(!case.path("log.checkMesh").exists());
    assert!(case.path("snappyHexMesh/system/snappyHexMeshDict").is_file());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Cleaned"));
}

#[test]
fn info_reports_an_idle_case() {
    let case = CaseFixture::new();
    let output = case.run(&["-i"]);
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "No solver is currently running.\n"
    );
}

#[test]
fn write_config_emits_loadable_defaults() {
    let case = CaseFixture::new();
    let output = case.run(&["--write-config"]);
    assert!(output.status.success());

    let config: serde_json::Value =
        serde_json::from_str(&case.read("gdaxs.json")).expect("parse config");
    assert_eq!(config["schema_version"], 1);
    assert_eq!(config["cores"], 2);
    assert_eq!(config["layout"]["working_dir"], "timeData");
}

#[test]
fn no_stage_selected_is_an_error() {
    let case = CaseFixture::new();
    let output = case.run(&["--interval", "2"]);
    assert!(!output.status.success());
}

#[test]
fn relative_env_script_resolves_from_the_case_directory() {
    if !have_bash() {
        return;
    }
    let case = CaseFixture::new();

    let output = case.run_in_case(&["-m"]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(case.calls(), strings(MESH_CALLS));
    assert_eq!(case.read("save/polyMesh/points"), "points\n");
}

#[test]
fn interrupt_stops_the_running_solver_and_exits_cleanly() {
    if !have_bash() || !have("kill") {
        return;
    }
    let case = CaseFixture::new();
    case.stall_solver("rhoReactingBuoyantFoam");
    case.write_config(r#"{"launcher": {"interrupt_grace_ms": 100}}"#);

    let mut child = case.spawn(&["-m", "-d", "-x"]);
    let deadline = Instant::now() + Duration::from_secs(20);
    while !case
        .calls()
        .iter()
        .any(|call| call.starts_with("rhoReactingBuoyantFoam"))
    {
        assert!(Instant::now() < deadline, "solver never started");
        thread::sleep(Duration::from_millis(20));
    }
    let status = Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .expect("send interrupt");
    assert!(status.success());

    let output = child.wait_with_output().expect("wait for gdaxs");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(!case.calls().iter().any(|call| call.starts_with("XiFoam")));
    assert!(!case.path("save/dispersion").exists());
    assert!(!case.path(".running.rhoReactingBuoyantFoam").exists());
    assert!(case
        .read("log.gdaxs")
        .contains("Cancelled rhoReactingBuoyantFoam during dispersion stage"));
}
