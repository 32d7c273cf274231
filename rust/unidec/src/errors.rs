/// Errors that abort a deconvolution run.
///
/// Recoverable numeric states (a zeroed grid mid-run, a degenerate mass
/// axis) are not errors, they are recorded as [`crate::Diagnostic`]s on the
/// returned [`crate::Decon`].
#[derive(Debug)]
pub enum UniDecError {
    ExpectedSlicesSameLength {
        expected: usize,
        other: usize,
        context: String,
    },
    ExpectedNonEmptyData {
        context: Option<String>,
    },
    UnsortedMz {
        index: usize,
    },
    DuplicateMz {
        index: usize,
        mz: f32,
    },
    ZeroChargeState,
    InvalidChargeRange {
        startz: i32,
        endz: i32,
    },
    ZeroPeakWidth,
    ZeroIsotopeSigma {
        mass: f32,
    },
    /// No (point, charge) cell survived the acceptance limits.
    InfeasibleSetup,
    UnknownPoolingMode(i32),
    UnknownPeakShape(i32),
    UnknownBaselineMode(i32),
    UnknownIsotopeMode(i32),
    UnknownReadoutMode(i32),
    MissingKernel,
    InvalidKernel {
        context: String,
    },
    Fft {
        context: String,
    },
}

impl std::fmt::Display for UniDecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UniDecError::ExpectedSlicesSameLength {
                expected,
                other,
                context,
            } => write!(
                f,
                "Expected slices of the same length ({} vs {}): {}",
                expected, other, context
            ),
            UniDecError::ExpectedNonEmptyData { context } => match context {
                Some(context) => write!(f, "Expected non-empty data: {}", context),
                None => write!(f, "Expected non-empty data"),
            },
            UniDecError::UnsortedMz { index } => {
                write!(f, "m/z values must be ascending, violated at index {}", index)
            }
            UniDecError::DuplicateMz { index, mz } => write!(
                f,
                "Duplicate m/z value {} at index {}, remove duplicates before deconvolution",
                mz, index
            ),
            UniDecError::ZeroChargeState => write!(f, "Charge state range includes zero"),
            UniDecError::InvalidChargeRange { startz, endz } => write!(
                f,
                "Invalid charge range: startz ({}) is larger than endz ({})",
                startz, endz
            ),
            UniDecError::ZeroPeakWidth => write!(f, "Peak shape sigma is 0"),
            UniDecError::ZeroIsotopeSigma { mass } => {
                write!(f, "Isotope envelope sigma is 0 for mass {}", mass)
            }
            UniDecError::InfeasibleSetup => write!(
                f,
                "Setup is bad: no points are accepted, check the mass and charge limits"
            ),
            UniDecError::UnknownPoolingMode(x) => write!(f, "Unknown pooling mode: {}", x),
            UniDecError::UnknownPeakShape(x) => write!(f, "Unknown peak shape function: {}", x),
            UniDecError::UnknownBaselineMode(x) => write!(f, "Unknown baseline mode: {}", x),
            UniDecError::UnknownIsotopeMode(x) => write!(f, "Unknown isotope mode: {}", x),
            UniDecError::UnknownReadoutMode(x) => write!(f, "Unknown readout mode: {}", x),
            UniDecError::MissingKernel => write!(
                f,
                "Double deconvolution is enabled but no kernel was supplied"
            ),
            UniDecError::InvalidKernel { context } => write!(f, "Invalid kernel: {}", context),
            UniDecError::Fft { context } => write!(f, "FFT failure: {}", context),
        }
    }
}

impl std::error::Error for UniDecError {}

impl From<realfft::FftError> for UniDecError {
    fn from(e: realfft::FftError) -> Self {
        UniDecError::Fft {
            context: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, UniDecError>;
