use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::process::Command;

use crate::paths::InstallLayout;
use crate::platform::PlatformProfile;

pub const MODULE_PATH_VAR: &str = "NODE_PATH";

/// Environment handed to a child process, fully materialised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildEnvironment {
    vars: BTreeMap<OsString, OsString>,
}

impl ChildEnvironment {
    pub fn get(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        self.vars.get(key.as_ref()).map(OsString::as_os_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn insert(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Replaces whatever `cmd` would have inherited.
    pub fn apply_to(&self, cmd: &mut Command) {
        cmd.env_clear();
        cmd.envs(self.iter());
    }
}

pub struct EnvironmentBuilder<'a> {
    profile: &'a PlatformProfile,
    layout: &'a InstallLayout,
    base: Vec<(OsString, OsString)>,
    overrides: Vec<(OsString, OsString)>,
}

impl<'a> EnvironmentBuilder<'a> {
    /// Starts from the current process environment.
    pub fn new(profile: &'a PlatformProfile, layout: &'a InstallLayout) -> Self {
        Self::from_vars(profile, layout, std::env::vars_os())
    }

    pub fn from_vars(
        profile: &'a PlatformProfile,
        layout: &'a InstallLayout,
        vars: impl IntoIterator<Item = (OsString, OsString)>,
    ) -> Self {
        Self {
            profile,
            layout,
            base: vars.into_iter().collect(),
            overrides: Vec::new(),
        }
    }

    pub fn set(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    pub fn overrides<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.overrides
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn build(self) -> ChildEnvironment {
        let Self {
            profile,
            layout,
            base,
            overrides,
        } = self;
        let mut vars: BTreeMap<OsString, OsString> = base.into_iter().collect();

        let path_key = existing_key(profile, &vars, profile.path_var_name());
        let mut path = OsString::from(layout.bin_dir.as_os_str());
        if let Some(prev) = vars.get(&path_key).filter(|v| !v.is_empty()) {
            path.push(profile.path_list_separator.to_string());
            path.push(prev);
        }
        vars.insert(path_key, path);

        let module_key = existing_key(profile, &vars, MODULE_PATH_VAR);
        vars.insert(module_key, layout.module_dir.clone().into_os_string());

        for (k, v) in overrides {
            let key = existing_key(profile, &vars, &k.to_string_lossy());
            vars.insert(key, v);
        }
        ChildEnvironment { vars }
    }
}

/// Windows variable names are case-insensitive; reuse the spelling
/// already present so `Path` and `PATH` do not both end up set.
fn existing_key(
    profile: &PlatformProfile,
    vars: &BTreeMap<OsString, OsString>,
    wanted: &str,
) -> OsString {
    if profile.is_windows() {
        if let Some(k) = vars
            .keys()
            .find(|k| k.to_string_lossy().eq_ignore_ascii_case(wanted))
        {
            return k.clone();
        }
    }
    OsString::from(wanted)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::paths::RuntimeSpec;
    use crate::platform::{Arch, Platform};

    fn fixture(platform: Platform) -> (PlatformProfile, InstallLayout) {
        let profile = PlatformProfile::new(platform, Arch::X64).unwrap();
        let spec = RuntimeSpec::new("22.9.0", profile).unwrap();
        let layout = InstallLayout::new(&spec, Path::new("/cache"));
        (profile, layout)
    }

    fn vars(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect()
    }

    #[test]
    fn prepends_bin_dir_and_sets_module_path() {
        let (profile, layout) = fixture(Platform::Linux);
        let env = EnvironmentBuilder::from_vars(
            &profile,
            &layout,
            vars(&[("PATH", "/usr/bin:/bin"), ("HOME", "/home/u")]),
        )
        .build();

        assert_eq!(
            env.get("PATH").unwrap(),
            OsStr::new("/cache/node-22.9.0/bin:/usr/bin:/bin")
        );
        assert_eq!(
            env.get("NODE_PATH").unwrap(),
            OsStr::new("/cache/node-22.9.0/lib/node_modules")
        );
        assert_eq!(env.get("HOME").unwrap(), OsStr::new("/home/u"));
    }

    #[test]
    fn missing_path_yields_only_bin_dir() {
        let (profile, layout) = fixture(Platform::Linux);
        let env = EnvironmentBuilder::from_vars(&profile, &layout, Vec::new()).build();
        assert_eq!(
            env.get("PATH").unwrap(),
            OsStr::new("/cache/node-22.9.0/bin")
        );
    }

    #[test]
    fn overrides_win_over_runtime_defaults_and_inherited() {
        let (profile, layout) = fixture(Platform::Linux);
        let env = EnvironmentBuilder::from_vars(
            &profile,
            &layout,
            vars(&[("PORT", "1"), ("NODE_PATH", "/old")]),
        )
        .set("PORT", "56765")
        .overrides([("NODE_PATH", "/custom")])
        .build();
        assert_eq!(env.get("PORT").unwrap(), OsStr::new("56765"));
        assert_eq!(env.get("NODE_PATH").unwrap(), OsStr::new("/custom"));
    }

    #[test]
    fn windows_reuses_existing_path_spelling_and_separator() {
        let (profile, layout) = fixture(Platform::Windows);
        let env = EnvironmentBuilder::from_vars(
            &profile,
            &layout,
            vars(&[("PATH", "C:\\Windows")]),
        )
        .build();
        assert!(env.get("Path").is_none());
        let path = env.get("PATH").unwrap().to_string_lossy().into_owned();
        assert!(path.ends_with(";C:\\Windows"), "{path}");
        assert!(path.starts_with(&layout.bin_dir.to_string_lossy().into_owned()));
    }
}
