//! Environment-manager detection and command templates.
//!
//! The notebook server must run inside the user's remote environment.  The
//! supported managers fall into two families:
//!
//! - **Conda-like** (micromamba, mamba, conda): `<manager> run [-n name|-p
//!   path] <command>`
//! - **Pixi**: `cd <project> && pixi run [-e env] <command>`, where the
//!   environment value uses the `project[:environment]` syntax
//!
//! Dispatch is over the [`EnvManagerKind`] tag; the probing that picks a
//! manager lives in the runner (it needs remote commands), while everything
//! here is pure template construction.

use crate::errors::{ForwardError, ForwardResult};
use crate::helpers::is_path;

// ---------------------------------------------------------------------------
// Manager kinds
// ---------------------------------------------------------------------------

/// The environment managers this tool knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvManagerKind {
    Micromamba,
    Mamba,
    Conda,
    Pixi,
}

impl EnvManagerKind {
    /// Conda-like probe order: first found wins.
    pub const CONDA_LIKE_PROBE_ORDER: [EnvManagerKind; 3] =
        [Self::Micromamba, Self::Mamba, Self::Conda];

    pub fn parse(name: &str) -> ForwardResult<Self> {
        match name {
            "micromamba" => Ok(Self::Micromamba),
            "mamba" => Ok(Self::Mamba),
            "conda" => Ok(Self::Conda),
            "pixi" => Ok(Self::Pixi),
            other => Err(ForwardError::UnknownEnvManager(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Micromamba => "micromamba",
            Self::Mamba => "mamba",
            Self::Conda => "conda",
            Self::Pixi => "pixi",
        }
    }

    pub fn is_conda_like(&self) -> bool {
        !matches!(self, Self::Pixi)
    }
}

// ---------------------------------------------------------------------------
// Command template
// ---------------------------------------------------------------------------

/// A resolved wrapper that activates the target environment around an
/// arbitrary command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvTemplate {
    /// Template with a literal `{command}` placeholder.
    template: String,
}

impl EnvTemplate {
    /// Conda-like wrapper: `<path> run [-n name|-p path] {command}`.
    ///
    /// The env option is `-p` when the value looks like a filesystem path,
    /// `-n` otherwise, and is omitted entirely when no env is given.
    pub fn conda_like(manager_path: &str, conda_env: Option<&str>) -> Self {
        let mut parts = vec![manager_path.to_string(), "run".to_string()];
        if let Some(env) = conda_env {
            if is_path(env) {
                parts.push(format!("-p {env}"));
            } else {
                parts.push(format!("-n {env}"));
            }
        }
        parts.push("{command}".to_string());
        Self {
            template: parts.join(" "),
        }
    }

    /// Pixi wrapper: `cd "<project>" && <path> run [-e env] {command}`.
    ///
    /// `conda_env` is required and uses the `project[:environment]` syntax,
    /// split on the last colon.
    pub fn pixi(pixi_path: &str, conda_env: Option<&str>) -> ForwardResult<Self> {
        let Some(env) = conda_env else {
            return Err(ForwardError::Config(
                "pixi requires --conda-env (global pixi installations are not supported)".into(),
            ));
        };

        let (project, option) = match env.rsplit_once(':') {
            Some((project, environment)) => (project, format!("-e {environment} ")),
            None => (env, String::new()),
        };

        Ok(Self {
            template: format!("cd \"{project}\" && {pixi_path} run {option}{{command}}"),
        })
    }

    /// Substitute `command` into the template.
    pub fn apply(&self, command: &str) -> String {
        self.template.replace("{command}", command)
    }

    /// The script form: a shebang line followed by the wrapped command,
    /// suitable for writing out as an executable batch job script.
    pub fn script(&self, shell: &str, command: &str) -> String {
        format!("#!/usr/bin/env {shell}\n\n{}\n", self.apply(command))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Kind parsing --------------------------------------------------------

    #[test]
    fn parse_known_managers() {
        assert_eq!(
            EnvManagerKind::parse("micromamba").unwrap(),
            EnvManagerKind::Micromamba
        );
        assert_eq!(EnvManagerKind::parse("pixi").unwrap(), EnvManagerKind::Pixi);
    }

    #[test]
    fn parse_unknown_manager() {
        let err = EnvManagerKind::parse("spack").unwrap_err();
        assert!(matches!(err, ForwardError::UnknownEnvManager(_)));
    }

    #[test]
    fn conda_like_classification() {
        assert!(EnvManagerKind::Mamba.is_conda_like());
        assert!(!EnvManagerKind::Pixi.is_conda_like());
    }

    // -- Conda-like templates ------------------------------------------------

    #[test]
    fn conda_named_env_uses_dash_n() {
        let template = EnvTemplate::conda_like("/opt/conda/bin/conda", Some("myenv"));
        assert_eq!(
            template.apply("jupyter lab"),
            "/opt/conda/bin/conda run -n myenv jupyter lab"
        );
        assert!(template.apply("x").contains("-n myenv"));
    }

    #[test]
    fn conda_path_env_uses_dash_p() {
        let template = EnvTemplate::conda_like("/usr/bin/mamba", Some("/scratch/envs/x"));
        assert!(template.apply("x").contains("-p /scratch/envs/x"));
    }

    #[test]
    fn conda_without_env_omits_option() {
        let template = EnvTemplate::conda_like("/usr/bin/micromamba", None);
        assert_eq!(
            template.apply("which jupyter"),
            "/usr/bin/micromamba run which jupyter"
        );
    }

    // -- Pixi templates ------------------------------------------------------

    #[test]
    fn pixi_requires_env() {
        let err = EnvTemplate::pixi("/usr/bin/pixi", None).unwrap_err();
        assert!(matches!(err, ForwardError::Config(_)));
    }

    #[test]
    fn pixi_project_and_environment() {
        let template = EnvTemplate::pixi("/usr/bin/pixi", Some("proj:dev")).unwrap();
        assert_eq!(
            template.apply("jupyter lab"),
            "cd \"proj\" && /usr/bin/pixi run -e dev jupyter lab"
        );
    }

    #[test]
    fn pixi_project_only() {
        let template = EnvTemplate::pixi("/usr/bin/pixi", Some("proj")).unwrap();
        assert_eq!(
            template.apply("jupyter lab"),
            "cd \"proj\" && /usr/bin/pixi run jupyter lab"
        );
    }

    #[test]
    fn pixi_splits_on_last_colon() {
        let template = EnvTemplate::pixi("/usr/bin/pixi", Some("a:b:dev")).unwrap();
        assert!(template.apply("x").starts_with("cd \"a:b\" &&"));
        assert!(template.apply("x").contains("-e dev"));
    }

    // -- Script form ---------------------------------------------------------

    #[test]
    fn script_form_has_shebang() {
        let template = EnvTemplate::conda_like("conda", Some("myenv"));
        let script = template.script("/bin/bash", "jupyter lab > log 2>&1");
        assert!(script.starts_with("#!/usr/bin/env /bin/bash\n"));
        assert!(script.contains("conda run -n myenv jupyter lab > log 2>&1"));
    }
}
