//! Toolchain command construction.
//!
//! The composer is toolchain-agnostic: it asks a `Toolchain` for the
//! concrete command lines and the flag-profile-derived extensions, and
//! applies the same witness discipline to whatever comes back. The clang
//! implementation is the default back-end.

use crate::path::AbsPath;
use crate::runtime::CommandSpec;

/// Options shared by every step of a build.
#[derive(Debug, Clone)]
pub struct CxxOptions {
    /// Source root; units below it keep their relative layout in the
    /// object and preprocess trees.
    pub root: AbsPath,
    /// Object-file output root.
    pub obj_dir: AbsPath,
    /// Preprocess-output root.
    pub src_dir: AbsPath,
    /// Executable and runtime-library output root.
    pub bin_dir: AbsPath,
    pub compiler: String,
    /// Emit textual intermediate representation instead of object code.
    pub assemble: bool,
    pub debug: bool,
    pub optimize: bool,
    /// Run a separate preprocess step before compiling.
    pub preprocess: bool,
    pub use_lld: bool,
}

impl Default for CxxOptions {
    fn default() -> Self {
        Self {
            root: AbsPath::new("."),
            obj_dir: AbsPath::new("obj/cxx"),
            src_dir: AbsPath::new("obj/cpp"),
            bin_dir: AbsPath::new("bin"),
            compiler: "clang++".to_string(),
            assemble: false,
            debug: false,
            optimize: false,
            preprocess: true,
            use_lld: lld_available(),
        }
    }
}

/// Probe PATH for lld so the LLVM pipeline can be preferred automatically.
pub fn lld_available() -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join("lld").is_file())
}

pub trait Toolchain: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Invariant flags shared by every step; these form the flag witness.
    fn base_args(&self, opts: &CxxOptions) -> Vec<String>;

    /// Object extension derived from the flag profile, so objects from
    /// different profiles never collide.
    fn object_extension(&self, opts: &CxxOptions) -> String;

    fn executable_extension(&self) -> &'static str;

    fn preprocess_command(
        &self,
        opts: &CxxOptions,
        source: &AbsPath,
        includes: &[AbsPath],
        output: &AbsPath,
    ) -> CommandSpec;

    /// `includes` is empty when compiling an already-preprocessed unit.
    fn compile_command(
        &self,
        opts: &CxxOptions,
        source: &AbsPath,
        includes: &[AbsPath],
        output: &AbsPath,
    ) -> CommandSpec;

    fn link_command(
        &self,
        opts: &CxxOptions,
        main_object: &AbsPath,
        objects: &[AbsPath],
        libraries: &[AbsPath],
        output: &AbsPath,
    ) -> CommandSpec;
}

#[derive(Debug, Default)]
pub struct ClangToolchain;

impl Toolchain for ClangToolchain {
    fn name(&self) -> &'static str {
        "clang"
    }

    fn base_args(&self, opts: &CxxOptions) -> Vec<String> {
        let mut args = vec!["-std=c++20".to_string(), "-Wc++17-extensions".to_string()];
        if opts.use_lld {
            args.push("-fuse-ld=lld".to_string());
        }
        if opts.debug {
            args.push("-g".to_string());
            args.push("-O0".to_string());
        }
        if opts.optimize {
            args.push("-O3".to_string());
        }
        args
    }

    fn object_extension(&self, opts: &CxxOptions) -> String {
        let base = match (opts.assemble, opts.use_lld) {
            (true, true) => "ll",
            (true, false) => "asm",
            (false, true) => "bc",
            (false, false) => "o",
        };
        if opts.debug {
            format!("g.{base}")
        } else {
            base.to_string()
        }
    }

    fn executable_extension(&self) -> &'static str {
        "exe"
    }

    fn preprocess_command(
        &self,
        opts: &CxxOptions,
        source: &AbsPath,
        includes: &[AbsPath],
        output: &AbsPath,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new(&opts.compiler)
            .arg(source.as_str())
            .args(self.base_args(opts));
        for include in includes {
            spec = spec.arg("--include-directory").arg(include.as_str());
        }
        spec.arg("--preprocess").arg("-o").arg(output.as_str())
    }

    fn compile_command(
        &self,
        opts: &CxxOptions,
        source: &AbsPath,
        includes: &[AbsPath],
        output: &AbsPath,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new(&opts.compiler)
            .arg(source.as_str())
            .args(self.base_args(opts));
        for include in includes {
            spec = spec.arg("--include-directory").arg(include.as_str());
        }
        spec = if opts.assemble {
            spec.arg("--assemble")
        } else {
            spec.arg("--compile")
        };
        if opts.use_lld {
            spec = spec.arg("-emit-llvm");
        }
        spec.arg("-o").arg(output.as_str())
    }

    fn link_command(
        &self,
        opts: &CxxOptions,
        main_object: &AbsPath,
        objects: &[AbsPath],
        libraries: &[AbsPath],
        output: &AbsPath,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new(&opts.compiler)
            .arg(main_object.as_str())
            .arg("-o")
            .arg(output.as_str())
            .args(self.base_args(opts));
        for object in objects {
            spec = spec.arg(object.as_str());
        }
        for library in libraries {
            spec = spec.arg("--for-linker").arg(library.as_str());
        }
        spec
    }
}
