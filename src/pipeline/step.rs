use std::fmt;
use std::str::FromStr;

/// Every step a target can place in its sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    Purge,
    SetupTargetPath,
    Unpack,
    UnpackSnapshot,
    LinkProfile,
    SetupConfigDir,
    OverlayRepository,
    Bind,
    ChrootSetup,
    SetupEnvironment,
    RunLocalPayload,
    Unbind,
    BuildPackages,
    BuildKernel,
    Bootloader,
    Preclean,
    UpdateLiveImage,
    RootOverlay,
    RunFsScript,
    UpdateInitScripts,
    UnmergePackages,
    RemovePaths,
    EmptyExcludedPaths,
    Clean,
    TargetSetup,
    SetupOverlay,
    CreateIso,
    SyncRepository,
    Capture,
    GenerateDigests,
    ClearResume,
}

impl Step {
    pub const ALL: [Step; 31] = [
        Step::Purge,
        Step::SetupTargetPath,
        Step::Unpack,
        Step::UnpackSnapshot,
        Step::LinkProfile,
        Step::SetupConfigDir,
        Step::OverlayRepository,
        Step::Bind,
        Step::ChrootSetup,
        Step::SetupEnvironment,
        Step::RunLocalPayload,
        Step::Unbind,
        Step::BuildPackages,
        Step::BuildKernel,
        Step::Bootloader,
        Step::Preclean,
        Step::UpdateLiveImage,
        Step::RootOverlay,
        Step::RunFsScript,
        Step::UpdateInitScripts,
        Step::UnmergePackages,
        Step::RemovePaths,
        Step::EmptyExcludedPaths,
        Step::Clean,
        Step::TargetSetup,
        Step::SetupOverlay,
        Step::CreateIso,
        Step::SyncRepository,
        Step::Capture,
        Step::GenerateDigests,
        Step::ClearResume,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::Purge => "purge",
            Step::SetupTargetPath => "setup-target-path",
            Step::Unpack => "unpack",
            Step::UnpackSnapshot => "unpack-snapshot",
            Step::LinkProfile => "link-profile",
            Step::SetupConfigDir => "setup-config-dir",
            Step::OverlayRepository => "overlay-repository",
            Step::Bind => "bind",
            Step::ChrootSetup => "chroot-setup",
            Step::SetupEnvironment => "setup-environment",
            Step::RunLocalPayload => "run-local-payload",
            Step::Unbind => "unbind",
            Step::BuildPackages => "build-packages",
            Step::BuildKernel => "build-kernel",
            Step::Bootloader => "bootloader",
            Step::Preclean => "preclean",
            Step::UpdateLiveImage => "update-live-image",
            Step::RootOverlay => "root-overlay",
            Step::RunFsScript => "run-fs-script",
            Step::UpdateInitScripts => "update-init-scripts",
            Step::UnmergePackages => "unmerge-packages",
            Step::RemovePaths => "remove-paths",
            Step::EmptyExcludedPaths => "empty-excluded-paths",
            Step::Clean => "clean",
            Step::TargetSetup => "target-setup",
            Step::SetupOverlay => "setup-overlay",
            Step::CreateIso => "create-iso",
            Step::SyncRepository => "sync-repository",
            Step::Capture => "capture",
            Step::GenerateDigests => "generate-digests",
            Step::ClearResume => "clear-resume",
        }
    }

    /// Whether completing the step records a resume point.
    ///
    /// Mount state, the exported environment and purging live only for one
    /// process, so those steps always run again on resume.
    pub fn is_resumable(self) -> bool {
        !matches!(
            self,
            Step::Purge | Step::Bind | Step::Unbind | Step::SetupEnvironment | Step::ClearResume
        )
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .iter()
            .copied()
            .find(|step| step.name() == s)
            .ok_or_else(|| format!("unknown step '{s}'"))
    }
}
