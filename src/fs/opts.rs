use crate::error::Error;

/// Options controlling how a file is opened.
///
/// Configure with the builder methods, then hand the mode to
/// [`File::open`](crate::fs::File::open). All flags start unset; a mode
/// with no access flags at all is rejected when the open is queued.
///
/// Truncation requires write access, and creating requires write or
/// append access. `create_new` subsumes `create` and `truncate`: the open
/// fails if the path already exists.
#[derive(Debug, Copy, Clone, Default)]
pub struct OpenMode {
    read: bool,
    write: bool,
    append: bool,
    truncate: bool,
    create: bool,
    create_new: bool,
}

impl OpenMode {
    /// A blank mode with every flag unset.
    pub fn new() -> OpenMode {
        OpenMode::default()
    }

    /// Request read access.
    pub fn read(&mut self, read: bool) -> &mut OpenMode {
        self.read = read;
        self
    }

    /// Request write access. Writes overwrite in place without truncating.
    pub fn write(&mut self, write: bool) -> &mut OpenMode {
        self.write = write;
        self
    }

    /// Append on write instead of overwriting. Implies write access.
    pub fn append(&mut self, append: bool) -> &mut OpenMode {
        self.append = append;
        self
    }

    /// Truncate the file to zero length if it exists.
    pub fn truncate(&mut self, truncate: bool) -> &mut OpenMode {
        self.truncate = truncate;
        self
    }

    /// Create the file if it does not exist.
    pub fn create(&mut self, create: bool) -> &mut OpenMode {
        self.create = create;
        self
    }

    /// Create the file, failing if the path already exists. The check and
    /// the creation are one atomic step.
    pub fn create_new(&mut self, create_new: bool) -> &mut OpenMode {
        self.create_new = create_new;
        self
    }

    pub(crate) fn access_mode(&self) -> Result<i32, Error> {
        match (self.read, self.write, self.append) {
            (true, false, false) => Ok(libc::O_RDONLY),
            (false, true, false) => Ok(libc::O_WRONLY),
            (true, true, false) => Ok(libc::O_RDWR),
            (false, _, true) => Ok(libc::O_WRONLY | libc::O_APPEND),
            (true, _, true) => Ok(libc::O_RDWR | libc::O_APPEND),
            (false, false, false) => Err(Error::InvalidArgument),
        }
    }

    pub(crate) fn creation_mode(&self) -> Result<i32, Error> {
        match (self.write, self.append) {
            (true, false) => {}
            (false, false) => {
                if self.truncate || self.create || self.create_new {
                    return Err(Error::InvalidArgument);
                }
            }
            (_, true) => {
                if self.truncate && !self.create_new {
                    return Err(Error::InvalidArgument);
                }
            }
        }

        Ok(match (self.create, self.truncate, self.create_new) {
            (false, false, false) => 0,
            (true, false, false) => libc::O_CREAT,
            (false, true, false) => libc::O_TRUNC,
            (true, true, false) => libc::O_CREAT | libc::O_TRUNC,
            (_, _, true) => libc::O_CREAT | libc::O_EXCL,
        })
    }

    /// Permission bits for files this open may create.
    pub(crate) fn permissions(&self) -> u32 {
        if self.create || self.create_new {
            0o666
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_mode() {
        let mut mode = OpenMode::new();
        mode.read(true);
        assert_eq!(mode.access_mode(), Ok(libc::O_RDONLY));
        assert_eq!(mode.creation_mode(), Ok(0));
        assert_eq!(mode.permissions(), 0);
    }

    #[test]
    fn no_access_is_invalid() {
        let mode = OpenMode::new();
        assert_eq!(mode.access_mode(), Err(Error::InvalidArgument));
    }

    #[test]
    fn truncate_requires_write() {
        let mut mode = OpenMode::new();
        mode.read(true).truncate(true);
        assert_eq!(mode.creation_mode(), Err(Error::InvalidArgument));
    }

    #[test]
    fn create_requires_write() {
        let mut mode = OpenMode::new();
        mode.read(true).create(true);
        assert_eq!(mode.creation_mode(), Err(Error::InvalidArgument));
    }

    #[test]
    fn append_truncate_conflict() {
        let mut mode = OpenMode::new();
        mode.append(true).truncate(true);
        assert_eq!(mode.creation_mode(), Err(Error::InvalidArgument));
        mode.create_new(true);
        assert_eq!(
            mode.creation_mode(),
            Ok(libc::O_CREAT | libc::O_EXCL)
        );
    }

    #[test]
    fn create_write_sets_permissions() {
        let mut mode = OpenMode::new();
        mode.write(true).create(true);
        assert_eq!(mode.access_mode(), Ok(libc::O_WRONLY));
        assert_eq!(mode.creation_mode(), Ok(libc::O_CREAT));
        assert_eq!(mode.permissions(), 0o666);
    }
}
