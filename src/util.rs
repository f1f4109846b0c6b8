use std::path::Path;

use rustix::{
    fs::{mkdir, Mode},
    io::{Errno, Result as ErrnoResult},
};

pub(crate) trait ErrnoFilter<T> {
    fn filter_errno(self, ignored: Errno) -> ErrnoResult<Option<T>>;
}

impl<T> ErrnoFilter<T> for ErrnoResult<T> {
    fn filter_errno(self, ignored: Errno) -> ErrnoResult<Option<T>> {
        match self {
            Ok(result) => Ok(Some(result)),
            Err(err) if err == ignored => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Creates the directory at `path` with the given permissions, unless something already exists
/// there.
///
/// Returns `true` if the directory was created.
pub fn ensure_dir(path: impl AsRef<Path>, mode: u32) -> ErrnoResult<bool> {
    Ok(mkdir(path.as_ref(), Mode::from_raw_mode(mode))
        .filter_errno(Errno::EXIST)?
        .is_some())
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_filter_errno() {
        let ok: ErrnoResult<u8> = Ok(1);
        assert_eq!(ok.filter_errno(Errno::NOENT), Ok(Some(1)));

        let ignored: ErrnoResult<u8> = Err(Errno::NOENT);
        assert_eq!(ignored.filter_errno(Errno::NOENT), Ok(None));

        let other: ErrnoResult<u8> = Err(Errno::ACCESS);
        assert_eq!(other.filter_errno(Errno::NOENT), Err(Errno::ACCESS));
    }

    #[test]
    fn test_ensure_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dev = tmp.path().join("dev");

        assert_eq!(ensure_dir(&dev, 0o755), Ok(true));
        assert!(dev.is_dir());
        assert_eq!(ensure_dir(&dev, 0o755), Ok(false)); // repeatable

        // missing parent is still an error
        assert_eq!(
            ensure_dir(tmp.path().join("a/b"), 0o755),
            Err(Errno::NOENT)
        );
    }
}
