//! Toolchain build profiles for the compiled Fortran/C solver kernels
//! this geometry feeds.
//!
//! The kernels build under a `make`-based system parametrized by a
//! per-platform `config.mk` fragment of plain variable assignments:
//! which MPI wrapper compilers to invoke, their flag strings, the
//! archiver, CGNS and PETSc include/link flags resolved from the
//! environment, and the Python/F2PY executables for the bindings.
//! This module models that fragment as data and renders it; it never
//! runs a compiler, and the build graph itself belongs to the
//! orchestrator consuming the fragment.

use std::fmt::Write;

/// Error resolving a [`BuildProfile`] from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// A required environment variable was not set.
    #[error("required environment variable '{0}' is not set")]
    MissingEnv(&'static str),
}

/// A supported target platform (operating system + Fortran toolchain).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    /// Linux with the Intel Fortran compiler behind the MPI wrappers.
    LinuxIntel,
    /// Linux with gfortran behind the MPI wrappers.
    LinuxGfortran,
}

impl Platform {
    /// The platform tag used in the fragment's file name,
    /// `config.<tag>.mk`.
    pub fn config_name(self) -> &'static str {
        match self {
            Platform::LinuxIntel => "LINUX_INTEL",
            Platform::LinuxGfortran => "LINUX_GFORTRAN",
        }
    }

    /// Fortran flag promoting default reals to 8 bytes,
    /// spelled differently by each compiler family.
    fn real_promotion_flag(self) -> &'static str {
        match self {
            Platform::LinuxIntel => "-r8",
            Platform::LinuxGfortran => "-fdefault-real-8",
        }
    }

    /// Extra flags for linking mixed Fortran/C objects.
    /// Intel needs to be told the main program is not Fortran.
    fn linker_flags(self) -> &'static str {
        match self {
            Platform::LinuxIntel => "-nofor_main",
            Platform::LinuxGfortran => "",
        }
    }
}

/// A resolved build configuration for one [`Platform`]:
/// every variable the `config.mk` fragment assigns.
///
/// Profiles are plain data. [`for_platform`][Self::for_platform]
/// resolves one against an environment lookup, and
/// [`render_mk`][Self::render_mk] is a pure function of the resolved
/// fields, so rendering the same profile twice gives identical bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildProfile {
    /// The platform this profile was resolved for.
    pub platform: Platform,
    /// Parallel `make` invocation alias (`PMAKE`).
    pub pmake: String,
    /// MPI Fortran wrapper compiler (`FF90`).
    pub fortran_compiler: String,
    /// MPI C wrapper compiler (`CC`).
    pub c_compiler: String,
    /// Fortran compiler flags: real-size promotion, optimization, `-fPIC`.
    pub fortran_flags: String,
    /// C compiler flags.
    pub c_flags: String,
    /// Flags for linking mixed Fortran/C objects.
    pub linker_flags: String,
    /// Archiver executable (`AR`).
    pub archiver: String,
    /// Archiver flags (`AR_FLAGS`).
    pub archiver_flags: String,
    /// CGNS include flags derived from `CGNS_HOME`.
    pub cgns_include_flags: String,
    /// CGNS link flags derived from `CGNS_HOME`.
    pub cgns_linker_flags: String,
    /// PETSc include flags derived from `PETSC_DIR`/`PETSC_ARCH`,
    /// empty when PETSc is not configured.
    pub petsc_include_flags: String,
    /// PETSc link flags, empty when PETSc is not configured.
    pub petsc_linker_flags: String,
    /// Python executable for the generated bindings.
    pub python: String,
    /// F2PY executable generating the Fortran bindings.
    pub f2py: String,
}

impl BuildProfile {
    /// Resolve the profile for a platform against an environment lookup.
    ///
    /// `env` maps variable names to values, so tests can resolve
    /// against a fixed table instead of the process environment.
    /// `CGNS_HOME` is required; `PETSC_DIR` (with an optional
    /// `PETSC_ARCH`) is optional, and leaving it unset simply leaves
    /// the PETSc flag strings empty.
    pub fn for_platform(
        platform: Platform,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ProfileError> {
        let cgns_home = env("CGNS_HOME").ok_or(ProfileError::MissingEnv("CGNS_HOME"))?;
        let (cgns_include_flags, cgns_linker_flags) = cgns_flags(&cgns_home);

        let (petsc_include_flags, petsc_linker_flags) = match env("PETSC_DIR") {
            Some(dir) => petsc_flags(&dir, env("PETSC_ARCH").as_deref()),
            None => (String::new(), String::new()),
        };

        Ok(Self {
            platform,
            pmake: "make -j 4".to_string(),
            fortran_compiler: "mpif90".to_string(),
            c_compiler: "mpicc".to_string(),
            fortran_flags: format!("{} -O2 -fPIC", platform.real_promotion_flag()),
            c_flags: "-O2 -fPIC".to_string(),
            linker_flags: platform.linker_flags().to_string(),
            archiver: "ar".to_string(),
            archiver_flags: "-rvs".to_string(),
            cgns_include_flags,
            cgns_linker_flags,
            petsc_include_flags,
            petsc_linker_flags,
            python: "python".to_string(),
            f2py: "f2py".to_string(),
        })
    }

    /// Resolve the profile against the process environment.
    pub fn from_env(platform: Platform) -> Result<Self, ProfileError> {
        Self::for_platform(platform, |name| std::env::var(name).ok())
    }

    /// Render the profile as the `config.mk` fragment the build
    /// orchestrator includes: comment lines and `VAR = value`
    /// assignments only, no recipes.
    pub fn render_mk(&self) -> String {
        let mut out = String::new();
        // the writer is a String, so none of these can fail
        let _ = writeln!(out, "# config.{}.mk", self.platform.config_name());
        let _ = writeln!(out, "# Toolchain profile for the compiled solver kernels.");
        let _ = writeln!(out);
        let _ = writeln!(out, "PMAKE = {}", self.pmake);
        let _ = writeln!(out);
        let _ = writeln!(out, "FF90 = {}", self.fortran_compiler);
        let _ = writeln!(out, "CC = {}", self.c_compiler);
        let _ = writeln!(out);
        let _ = writeln!(out, "FF90_FLAGS = {}", self.fortran_flags);
        let _ = writeln!(out, "CC_FLAGS = {}", self.c_flags);
        let _ = writeln!(out, "LINKER_FLAGS = {}", self.linker_flags);
        let _ = writeln!(out);
        let _ = writeln!(out, "AR = {}", self.archiver);
        let _ = writeln!(out, "AR_FLAGS = {}", self.archiver_flags);
        let _ = writeln!(out);
        let _ = writeln!(out, "CGNS_INCLUDE_FLAGS = {}", self.cgns_include_flags);
        let _ = writeln!(out, "CGNS_LINKER_FLAGS = {}", self.cgns_linker_flags);
        let _ = writeln!(out, "PETSC_INCLUDE_FLAGS = {}", self.petsc_include_flags);
        let _ = writeln!(out, "PETSC_LINKER_FLAGS = {}", self.petsc_linker_flags);
        let _ = writeln!(out);
        let _ = writeln!(out, "PYTHON = {}", self.python);
        let _ = writeln!(out, "F2PY = {}", self.f2py);
        out
    }
}

/// CGNS `(include, link)` flag strings for an install root.
pub fn cgns_flags(home: &str) -> (String, String) {
    (
        format!("-I{home}/include"),
        format!("-L{home}/lib -lcgns"),
    )
}

/// PETSc `(include, link)` flag strings for an install root.
///
/// With a `PETSC_ARCH`, headers live both in the source tree and the
/// per-arch build directory and the library under the arch; without
/// one, everything sits directly under `PETSC_DIR` (a prefix install).
pub fn petsc_flags(dir: &str, arch: Option<&str>) -> (String, String) {
    match arch {
        Some(arch) if !arch.is_empty() => (
            format!("-I{dir}/include -I{dir}/{arch}/include"),
            format!("-L{dir}/{arch}/lib -lpetsc"),
        ),
        _ => (
            format!("-I{dir}/include"),
            format!("-L{dir}/lib -lpetsc"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_table(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let table: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| table.get(name).cloned()
    }

    /// A full Intel profile resolves compilers, flags, and both
    /// library flag pairs from the environment.
    #[test]
    fn intel_profile_resolves_from_env() {
        let env = env_table(&[
            ("CGNS_HOME", "/opt/cgns"),
            ("PETSC_DIR", "/opt/petsc"),
            ("PETSC_ARCH", "arch-linux-c-opt"),
        ]);
        let profile = BuildProfile::for_platform(Platform::LinuxIntel, env).unwrap();
        assert_eq!(profile.fortran_compiler, "mpif90");
        assert_eq!(profile.c_compiler, "mpicc");
        assert_eq!(profile.fortran_flags, "-r8 -O2 -fPIC");
        assert_eq!(profile.linker_flags, "-nofor_main");
        assert_eq!(profile.archiver, "ar");
        assert_eq!(profile.archiver_flags, "-rvs");
        assert_eq!(profile.cgns_include_flags, "-I/opt/cgns/include");
        assert_eq!(profile.cgns_linker_flags, "-L/opt/cgns/lib -lcgns");
        assert_eq!(
            profile.petsc_include_flags,
            "-I/opt/petsc/include -I/opt/petsc/arch-linux-c-opt/include"
        );
        assert_eq!(
            profile.petsc_linker_flags,
            "-L/opt/petsc/arch-linux-c-opt/lib -lpetsc"
        );
        assert_eq!(profile.f2py, "f2py");
    }

    /// The gfortran profile differs only where the compiler family
    /// does: real promotion spelling and the mixed-language link flag.
    #[test]
    fn gfortran_profile_differs_in_compiler_flags() {
        let env = env_table(&[("CGNS_HOME", "/opt/cgns")]);
        let intel = BuildProfile::for_platform(Platform::LinuxIntel, &env).unwrap();
        let gfortran = BuildProfile::for_platform(Platform::LinuxGfortran, &env).unwrap();
        assert_eq!(gfortran.fortran_flags, "-fdefault-real-8 -O2 -fPIC");
        assert_eq!(gfortran.linker_flags, "");
        assert_eq!(gfortran.fortran_compiler, intel.fortran_compiler);
        assert_eq!(gfortran.c_flags, intel.c_flags);
        assert_eq!(gfortran.cgns_linker_flags, intel.cgns_linker_flags);
    }

    /// CGNS is mandatory; PETSc is optional and resolves without an arch.
    #[test]
    fn cgns_is_required_and_petsc_optional() {
        assert!(matches!(
            BuildProfile::for_platform(Platform::LinuxIntel, |_| None),
            Err(ProfileError::MissingEnv("CGNS_HOME"))
        ));

        let bare = env_table(&[("CGNS_HOME", "/opt/cgns")]);
        let profile = BuildProfile::for_platform(Platform::LinuxIntel, bare).unwrap();
        assert_eq!(profile.petsc_include_flags, "");
        assert_eq!(profile.petsc_linker_flags, "");

        let prefix = env_table(&[("CGNS_HOME", "/opt/cgns"), ("PETSC_DIR", "/opt/petsc")]);
        let profile = BuildProfile::for_platform(Platform::LinuxIntel, prefix).unwrap();
        assert_eq!(profile.petsc_include_flags, "-I/opt/petsc/include");
        assert_eq!(profile.petsc_linker_flags, "-L/opt/petsc/lib -lpetsc");
    }

    /// Rendering is deterministic and emits assignments only:
    /// every non-comment, non-blank line is `VAR = value`
    /// with no recipe lines.
    #[test]
    fn render_is_deterministic_assignments_only() {
        let env = env_table(&[
            ("CGNS_HOME", "/opt/cgns"),
            ("PETSC_DIR", "/opt/petsc"),
            ("PETSC_ARCH", "arch-linux-c-opt"),
        ]);
        let profile = BuildProfile::for_platform(Platform::LinuxIntel, env).unwrap();
        let rendered = profile.render_mk();
        assert_eq!(rendered, profile.render_mk());

        assert!(rendered.starts_with("# config.LINUX_INTEL.mk"));
        assert!(rendered.contains("PMAKE = make -j 4\n"));
        assert!(rendered.contains("FF90 = mpif90\n"));
        assert!(rendered.contains("CGNS_LINKER_FLAGS = -L/opt/cgns/lib -lcgns\n"));
        for line in rendered.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            assert!(line.contains(" = "), "not an assignment: {line}");
            assert!(!line.starts_with('\t'), "recipe line: {line}");
        }
    }

    /// Unset PETSc leaves its assignments empty but present,
    /// so the orchestrator can expand them unconditionally.
    #[test]
    fn render_keeps_empty_petsc_assignments() {
        let env = env_table(&[("CGNS_HOME", "/opt/cgns")]);
        let profile = BuildProfile::for_platform(Platform::LinuxGfortran, env).unwrap();
        let rendered = profile.render_mk();
        assert!(rendered.starts_with("# config.LINUX_GFORTRAN.mk"));
        assert!(rendered.contains("\nPETSC_INCLUDE_FLAGS = \n"));
        assert!(rendered.contains("\nPETSC_LINKER_FLAGS = \n"));
        assert!(rendered.contains("\nLINKER_FLAGS = \n"));
    }
}
