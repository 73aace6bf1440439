/// Exit code issued when a bq process itself fails, as opposed to the tests it runs.
pub const CODE_ERROR: i32 = 101;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct ExitCode(i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    /// Some tests of a job failed.
    pub const FAILURE: ExitCode = ExitCode(1);
    pub const BQ_ERROR: ExitCode = ExitCode(CODE_ERROR);

    pub const fn get(&self) -> i32 {
        self.0
    }

    pub const fn new(code: i32) -> Self {
        Self(code)
    }
}
