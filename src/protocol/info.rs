use serde::Serialize;

/// Body of `/v4/info`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    pub version: Version,
    pub build_time: u64,
    pub git: GitInfo,
    pub source_managers: Vec<String>,
    pub filters: Vec<String>,
    pub plugins: Vec<Plugin>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub semver: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_release: Option<String>,
}

impl Version {
    pub fn current() -> Self {
        let semver = env!("CARGO_PKG_VERSION");
        let (core, pre_release) = match semver.split_once('-') {
            Some((core, pre)) => (core, Some(pre.to_string())),
            None => (semver, None),
        };
        let mut parts = core.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
        Self {
            semver: semver.to_string(),
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
            pre_release,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitInfo {
    pub branch: String,
    pub commit: String,
    pub commit_time: u64,
}

impl GitInfo {
    pub fn current() -> Self {
        Self {
            branch: option_env!("GIT_BRANCH").unwrap_or("unknown").to_string(),
            commit: option_env!("GIT_COMMIT").unwrap_or("unknown").to_string(),
            commit_time: option_env!("GIT_COMMIT_TIME")
                .and_then(|t| t.parse().ok())
                .unwrap_or(0),
        }
    }
}

/// Build time in unix milliseconds, 0 when unknown.
pub fn build_time() -> u64 {
    option_env!("BUILD_TIME")
        .and_then(|t| t.parse().ok())
        .unwrap_or(0)
}

#[derive(Debug, Serialize)]
pub struct Plugin {
    pub name: String,
    pub version: String,
}

/// Body of `/v4/version`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    pub build_time: u64,
    pub commit: String,
    pub source_version: String,
}

impl VersionInfo {
    pub fn current() -> Self {
        let git = GitInfo::current();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            build_time: build_time(),
            source_version: git.branch,
            commit: git.commit,
        }
    }
}
