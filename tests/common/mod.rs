//! Shared test infrastructure for integration tests.
//!
//! A `CaseFixture` is a scratch case directory with the three stage templates
//! and a folder of stub solvers. The environment script puts the stubs first
//! on `PATH`, so the real toolkit is never needed.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use tempfile::TempDir;

const DECOMPOSE_DICT: &str = "numberOfSubdomains 2;\nmethod          scotch;\n";
const CONTROL_DICT: &str = "\
application     solver;
endTime         0.5;
writeFormat     ascii;
";

/// Every command the default stage sequences invoke.
const SOLVERS: &[&str] = &[
    "surfaceFeatureExtract",
    "blockMesh",
    "decomposePar",
    "snappyHexMesh",
    "reconstructParMesh",
    "checkMesh",
    "rhoReactingBuoyantFoam",
    "reconstructPar",
    "foamFormatConvert",
    "XiFoam",
];

const DISPERSION_FIELDS: &str = "T H2 p_rgh alphat epsilon k nut U";

pub fn have_bash() -> bool {
    have("bash")
}

pub fn have(tool: &str) -> bool {
    let found = which::which(tool).is_ok();
    if !found {
        eprintln!("Skipping: {tool} not available");
    }
    found
}

pub struct CaseFixture {
    dir: TempDir,
}

impl CaseFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let fixture = Self { dir };
        fixture.write_templates();
        fixture.write_stubs();
        fixture
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).unwrap_or_else(|err| panic!("read {rel}: {err}"))
    }

    /// Commands the stubs recorded, one per line, in invocation order.
    pub fn calls(&self) -> Vec<String> {
        match fs::read_to_string(self.path("calls.txt")) {
            Ok(text) => text.lines().map(|line| line.trim_end().to_string()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Make one stub fail with exit status 1 after recording its call.
    pub fn fail_solver(&self, name: &str) {
        self.write_stub(name, "exit 1\n");
    }

    /// Make one stub record its call and then block until it is stopped.
    pub fn stall_solver(&self, name: &str) {
        self.write_stub(name, "exec sleep 30\n");
    }

    /// Write a partial config; omitted fields keep their defaults.
    pub fn write_config(&self, json: &str) {
        self.write("gdaxs.json", json);
    }

    /// Run the binary against this case with the stub environment.
    pub fn run(&self, args: &[&str]) -> Output {
        self.command(args).output().expect("run gdaxs")
    }

    /// Start the binary without waiting for it.
    pub fn spawn(&self, args: &[&str]) -> Child {
        self.command(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn gdaxs")
    }

    /// Run from inside the case directory, naming the env script relatively.
    pub fn run_in_case(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_gdaxs"))
            .current_dir(self.root())
            .args(args)
            .args(["--env-script", "bashrc", "--cores", "3"])
            .env("GDAXS_LOG", "warn")
            .output()
            .expect("run gdaxs")
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_gdaxs"));
        command
            .args(args)
            .arg("--case-dir")
            .arg(self.root())
            .arg("--env-script")
            .arg(self.path("bashrc"))
            .arg("--cores")
            .arg("3")
            .env("GDAXS_LOG", "warn");
        command
    }

    fn write(&self, rel: &str, text: &str) {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
        fs::write(&path, text).expect("write file");
    }

    fn write_templates(&self) {
        self.write("snappyHexMesh/system/decomposeParDict", DECOMPOSE_DICT);
        self.write(
            "snappyHexMesh/system/snappyHexMeshDict",
            "castellatedMeshControls\n{\n    locationInMesh (0 0 0);\n}\n",
        );
        self.write("snappyHexMesh/constant/triSurface/tank.stl", "solid tank\n");

        self.write("rhoReactingBuoyantFoam/system/decomposeParDict", DECOMPOSE_DICT);
        self.write("rhoReactingBuoyantFoam/system/controlDict", CONTROL_DICT);
        self.write("rhoReactingBuoyantFoam/constant/g", "value (0 0 -9.81);\n");
        self.write("rhoReactingBuoyantFoam/0/U", "    object      U;\n");

        self.write("XiFoam/system/decomposeParDict", DECOMPOSE_DICT);
        self.write("XiFoam/system/controlDict", CONTROL_DICT);
        self.write(
            "XiFoam/constant/combustionProperties",
            "ignitionSites\n(\n    {\n        location        (0 0 0);\n    }\n);\n",
        );
        self.write("XiFoam/0/Su", "    object      Su;\n");

        self.write(
            "bashrc",
            &format!("export PATH=\"{}:$PATH\"\n", self.path("stubs").display()),
        );
    }

    fn write_stubs(&self) {
        for name in SOLVERS {
            let body = match *name {
                "blockMesh" => "mkdir -p constant/polyMesh && echo points > constant/polyMesh/points\n".to_string(),
                "rhoReactingBuoyantFoam" => format!(
                    "mkdir -p 10\nfor f in {DISPERSION_FIELDS}; do printf '    object      %s;\\n' \"$f\" > \"10/$f\"; done\n"
                ),
                "XiFoam" => "mkdir -p 1 && cp 0/Tu 1/Tu\n".to_string(),
                _ => String::new(),
            };
            self.write_stub(name, &body);
        }
        self.write_executable(
            "stubs/mpirun",
            "#!/bin/sh\nwhile [ \"$1\" != \"-np\" ]; do shift; done\nshift 2\nexec \"$@\"\n",
        );
    }

    fn write_stub(&self, name: &str, body: &str) {
        let record = format!(
            "#!/bin/sh\necho \"$(basename \"$0\") $*\" >> \"{}\"\n",
            self.path("calls.txt").display()
        );
        self.write_executable(&format!("stubs/{name}"), &format!("{record}{body}"));
    }

    fn write_executable(&self, rel: &str, text: &str) {
        self.write(rel, text);
        let path = self.path(rel);
        let mut permissions = fs::metadata(&path).expect("stat stub").permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions).expect("chmod stub");
    }
}
