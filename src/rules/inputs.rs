//! Rules that add build inputs.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use super::{Hints, Rule, RuleContext, RuleEffect, RuleError, RuleOutput, accumulate, expect_list};
use crate::lognorm::FailureRecord;
use crate::merge::strategy::AttrKey;
use crate::model::{OptionValue, RuleState};

const CMAKE: &str = "pkgs.cmake";

const NATIVE_HINTS: Hints = &[
    ("No such file or directory: 'gfortran'", &["pkgs.gfortran"]),
    ("Did not find pkg-config", &["pkgs.pkg-config"]),
    (
        "The headers or library files could not be found for zlib,",
        &["pkgs.pkg-config", "pkgs.zlib.dev"],
    ),
    (
        "zlib.h: No such file or directory",
        &["pkgs.pkg-config", "pkgs.zlib.dev"],
    ),
    ("CMake must be installed", &[CMAKE]),
    ("No such file or directory: 'cmake'", &[CMAKE]),
    ("No such file or directory: 'meson'", &["pkgs.meson"]),
    ("No such file or directory: 'ninja'", &["pkgs.ninja"]),
];

const BUILD_HINTS: Hints = &[
    (
        "error: libhdf5.so: cannot open shared object file",
        &["pkgs.hdf5"],
    ),
    ("libtbb.so.12 -> not found!", &["pkgs.tbb_2021_11.out"]),
    ("Dependency \"OpenBLAS\" not found", &["pkgs.openblas"]),
    ("ffi.h: No such file or directory", &["pkgs.libffi"]),
    ("openssl/ssl.h: No such file or directory", &["pkgs.openssl.dev"]),
    (
        "libxml/xmlversion.h: No such file or directory",
        &["pkgs.libxml2.dev"],
    ),
];

/// CUDA runtime libraries and the packages that provide them.
const CUDA_LIBRARIES: &[(&str, &str)] = &[
    ("libcudart", "pkgs.cudaPackages.cuda_cudart"),
    ("libcublas", "pkgs.cudaPackages.libcublas"),
    ("libcufft", "pkgs.cudaPackages.libcufft"),
    ("libcurand", "pkgs.cudaPackages.libcurand"),
    ("libcusparse", "pkgs.cudaPackages.libcusparse"),
    ("libcusolver", "pkgs.cudaPackages.libcusolver"),
    ("libnvrtc", "pkgs.cudaPackages.cuda_nvrtc"),
    ("libnvJitLink", "pkgs.cudaPackages.libnvjitlink"),
];

static MISSING_LIBRARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(lib[A-Za-z0-9_]+)\.so[.0-9]*(?::| ->) (?:cannot open shared object file|not found)")
        .expect("static regex")
});

fn unexpected(rule: &'static str, value: &OptionValue) -> RuleError {
    RuleError::UnexpectedValue {
        rule,
        value: value.clone(),
    }
}

// ---------------------------------------------------------------------------
// native-build-inputs
// ---------------------------------------------------------------------------

/// Build tools missing from the sandbox.
pub struct NativeBuildInputs;

impl Rule for NativeBuildInputs {
    fn name(&self) -> &'static str {
        "native-build-inputs"
    }

    fn matches(
        &self,
        _ctx: &RuleContext<'_>,
        failure: &FailureRecord,
        previous: Option<&OptionValue>,
        _state: &RuleState,
    ) -> Option<OptionValue> {
        accumulate(previous, &failure.log, NATIVE_HINTS, OptionValue::Literal)
    }

    fn apply(
        &self,
        _ctx: &RuleContext<'_>,
        value: &OptionValue,
    ) -> Result<Vec<RuleEffect>, RuleError> {
        let inputs = expect_list(self.name(), value)?;
        Ok(vec![RuleEffect::Output(
            RuleOutput::default()
                .argument("pkgs")
                .src(AttrKey::NativeBuildInputs, inputs),
        )])
    }
}

// ---------------------------------------------------------------------------
// build-inputs
// ---------------------------------------------------------------------------

/// Libraries missing at build or load time.
pub struct BuildInputs;

impl Rule for BuildInputs {
    fn name(&self) -> &'static str {
        "build-inputs"
    }

    fn matches(
        &self,
        _ctx: &RuleContext<'_>,
        failure: &FailureRecord,
        previous: Option<&OptionValue>,
        _state: &RuleState,
    ) -> Option<OptionValue> {
        accumulate(previous, &failure.log, BUILD_HINTS, OptionValue::Literal)
    }

    fn apply(
        &self,
        _ctx: &RuleContext<'_>,
        value: &OptionValue,
    ) -> Result<Vec<RuleEffect>, RuleError> {
        let inputs = expect_list(self.name(), value)?;
        Ok(vec![RuleEffect::Output(
            RuleOutput::default()
                .argument("pkgs")
                .both(AttrKey::BuildInputs, inputs),
        )])
    }
}

// ---------------------------------------------------------------------------
// cuda
// ---------------------------------------------------------------------------

/// Missing CUDA runtime libraries. These live in the newer package snapshot.
pub struct Cuda;

impl Rule for Cuda {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn matches(
        &self,
        _ctx: &RuleContext<'_>,
        failure: &FailureRecord,
        previous: Option<&OptionValue>,
        _state: &RuleState,
    ) -> Option<OptionValue> {
        let hits: BTreeSet<&str> = MISSING_LIBRARY
            .captures_iter(&failure.log)
            .filter_map(|cap| {
                let lib = cap.get(1)?.as_str();
                CUDA_LIBRARIES
                    .iter()
                    .find(|(name, _)| *name == lib)
                    .map(|(_, attr)| *attr)
            })
            .collect();
        if hits.is_empty() {
            return None;
        }
        let mut items: BTreeSet<String> = previous
            .map(OptionValue::list_texts)
            .unwrap_or_default()
            .into_iter()
            .collect();
        items.extend(hits.into_iter().map(str::to_owned));
        Some(OptionValue::literals(items))
    }

    fn apply(
        &self,
        _ctx: &RuleContext<'_>,
        value: &OptionValue,
    ) -> Result<Vec<RuleEffect>, RuleError> {
        let inputs = expect_list(self.name(), value)?;
        let mut output = RuleOutput::default()
            .argument("pkgs")
            .both(AttrKey::BuildInputs, inputs);
        output.newer_nixpkgs = true;
        Ok(vec![RuleEffect::Output(output)])
    }
}

// ---------------------------------------------------------------------------
// dont-use-cmake-configure
// ---------------------------------------------------------------------------

/// Python build backends drive cmake themselves; the cmake setup hook's own
/// configure phase must stay out of the way whenever cmake is an input.
pub struct DontUseCmakeConfigure;

impl Rule for DontUseCmakeConfigure {
    fn name(&self) -> &'static str {
        "dont-use-cmake-configure"
    }

    fn matches(
        &self,
        _ctx: &RuleContext<'_>,
        _failure: &FailureRecord,
        _previous: Option<&OptionValue>,
        state: &RuleState,
    ) -> Option<OptionValue> {
        let cmake = OptionValue::Literal(CMAKE.to_owned());
        state
            .get("native-build-inputs")
            .is_some_and(|inputs| inputs.list_contains(&cmake))
            .then_some(OptionValue::Bool(true))
    }

    fn apply(
        &self,
        _ctx: &RuleContext<'_>,
        value: &OptionValue,
    ) -> Result<Vec<RuleEffect>, RuleError> {
        match value {
            OptionValue::Bool(flag) => Ok(vec![RuleEffect::Output(
                RuleOutput::default().src(AttrKey::DontUseCmakeConfigure, (*flag).into()),
            )]),
            other => Err(unexpected(self.name(), other)),
        }
    }

    fn always_reapply(&self) -> bool {
        true
    }
}
