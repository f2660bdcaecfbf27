//! Exit codes reserved for internal signaling.

use std::fmt;

/// Codes the shell uses to report how a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservedExitCode {
    Success,
    /// A script file to run could not be found
    NoFile,
    /// A user code collided with a reserved one
    IllegalCode,
    /// A user code collided with [`ReservedExitCode::IllegalCode`] itself
    IllegalCodeAlt,
    /// Input ended with no other session to hand focus to
    NoInput,
    CompileFail,
    CompileAbort,
    Killed,
}

impl ReservedExitCode {
    pub const ALL: [ReservedExitCode; 8] = [
        ReservedExitCode::Success,
        ReservedExitCode::NoFile,
        ReservedExitCode::IllegalCode,
        ReservedExitCode::IllegalCodeAlt,
        ReservedExitCode::NoInput,
        ReservedExitCode::CompileFail,
        ReservedExitCode::CompileAbort,
        ReservedExitCode::Killed,
    ];

    pub const fn code(self) -> i32 {
        match self {
            ReservedExitCode::Success => 0,
            ReservedExitCode::NoFile => 0x1F,
            ReservedExitCode::IllegalCode => 0x2F,
            ReservedExitCode::IllegalCodeAlt => 0x3F,
            ReservedExitCode::NoInput => 0x4F,
            ReservedExitCode::CompileFail => 0x5F,
            ReservedExitCode::CompileAbort => 0x6F,
            ReservedExitCode::Killed => 0x7F,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.code() == code)
    }

    pub fn label(self) -> &'static str {
        match self {
            ReservedExitCode::Success => "success",
            ReservedExitCode::NoFile => "no such file",
            ReservedExitCode::IllegalCode | ReservedExitCode::IllegalCodeAlt => "illegal exit code",
            ReservedExitCode::NoInput => "no input",
            ReservedExitCode::CompileFail => "compile failed",
            ReservedExitCode::CompileAbort => "compile aborted",
            ReservedExitCode::Killed => "killed",
        }
    }

    /// Map a user-supplied code onto one that cannot be mistaken for an
    /// internal signal. Returns the accepted code and whether it was remapped.
    pub fn sanitize(code: i32) -> (i32, bool) {
        match Self::from_code(code) {
            None | Some(ReservedExitCode::Success) => (code, false),
            Some(ReservedExitCode::IllegalCode) => (ReservedExitCode::IllegalCodeAlt.code(), true),
            Some(_) => (ReservedExitCode::IllegalCode.code(), true),
        }
    }
}

impl fmt::Display for ReservedExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x} ({})", self.code(), self.label())
    }
}

/// Human-readable description of any exit code
pub fn describe(code: i32) -> String {
    match ReservedExitCode::from_code(code) {
        Some(reserved) => reserved.to_string(),
        None => format!("{}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(ReservedExitCode::Success.code(), 0);
        assert_eq!(ReservedExitCode::NoFile.code(), 0x1F);
        assert_eq!(ReservedExitCode::Killed.code(), 0x7F);
        assert_eq!(ReservedExitCode::from_code(0x5F), Some(ReservedExitCode::CompileFail));
        assert_eq!(ReservedExitCode::from_code(3), None);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(ReservedExitCode::sanitize(0), (0, false));
        assert_eq!(ReservedExitCode::sanitize(3), (3, false));
        assert_eq!(ReservedExitCode::sanitize(0x2F), (0x3F, true));
        assert_eq!(ReservedExitCode::sanitize(0x7F), (0x2F, true));
        assert_eq!(ReservedExitCode::sanitize(0x3F), (0x2F, true));
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(0x1F), "0x1f (no such file)");
        assert_eq!(describe(5), "5");
    }
}
