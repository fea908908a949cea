#![cfg(target_os = "linux")]

mod util;

use gyre::buf::Buffer;
use gyre::fs::{File, FileState, OpenMode, SeekOrigin};
use gyre::Error;

use util::{drive, take_completion, with_test_env, TestDir};

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[test]
fn write_then_read_round_trip() -> TestResult {
    let dir = TestDir::new();
    with_test_env(|ctx| {
        let handle = ctx.handle();
        let file = File::create(&handle, 1);
        assert_eq!(file.state(), FileState::Closed);

        let mut mode = OpenMode::new();
        mode.read(true).write(true).create(true);
        let open_id = file.open(dir.join("data.bin"), mode)?;
        let mut done = drive(ctx, 1)?;
        let open = take_completion(&mut done, open_id).unwrap();
        assert!(open.result().is_ok());
        assert_eq!(open.user_data(), 1);
        assert_eq!(file.state(), FileState::Opened);

        let mut buf = Buffer::create(64)?;
        buf.extend_from_slice(b"all the king's horses")?;
        let len = buf.len();
        let write_id = file.write(buf, Some(0)).map_err(|(err, _)| err)?;
        let mut done = drive(ctx, 1)?;
        let mut write = take_completion(&mut done, write_id).unwrap();
        assert_eq!(write.result().unwrap(), len as i64);
        assert!(write.take_buffer().is_some());

        let read_id = file
            .read(Buffer::create(64)?, Some(0))
            .map_err(|(err, _)| err)?;
        let mut done = drive(ctx, 1)?;
        let mut read = take_completion(&mut done, read_id).unwrap();
        assert_eq!(read.result().unwrap(), len as i64);
        let buf = read.take_buffer().unwrap();
        assert_eq!(buf.as_slice(), b"all the king's horses");
        Ok(())
    })
}

#[test]
fn open_missing_file_fails_and_stays_closed() -> TestResult {
    let dir = TestDir::new();
    with_test_env(|ctx| {
        let file = File::create(&ctx.handle(), 0);
        let mut mode = OpenMode::new();
        mode.read(true);
        let open_id = file.open(dir.join("does-not-exist"), mode)?;
        let mut done = drive(ctx, 1)?;
        let open = take_completion(&mut done, open_id).unwrap();
        assert_eq!(
            open.result().unwrap_err(),
            Error::Unknown {
                errno: libc::ENOENT
            }
        );
        assert_eq!(file.state(), FileState::Closed);
        Ok(())
    })
}

#[test]
fn io_before_open_is_rejected() -> TestResult {
    with_test_env(|ctx| {
        let file = File::create(&ctx.handle(), 0);
        let (err, _) = file.read(Buffer::create(8)?, None).unwrap_err();
        assert_eq!(err, Error::BadFileDescriptor);
        assert_eq!(file.flush().unwrap_err(), Error::BadFileDescriptor);
        assert_eq!(file.size().unwrap_err(), Error::BadFileDescriptor);
        assert_eq!(
            file.seek(0, SeekOrigin::Begin).unwrap_err(),
            Error::BadFileDescriptor
        );
        assert_eq!(ctx.last_error(), Some(Error::BadFileDescriptor));
        Ok(())
    })
}

#[test]
fn open_twice_is_rejected() -> TestResult {
    let dir = TestDir::new();
    with_test_env(|ctx| {
        let file = File::create(&ctx.handle(), 0);
        let mut mode = OpenMode::new();
        mode.write(true).create(true);

        // While the first open is still in flight.
        file.open(dir.join("a.bin"), mode)?;
        assert_eq!(
            file.open(dir.join("b.bin"), mode).unwrap_err(),
            Error::InvalidArgument
        );

        drive(ctx, 1)?;
        assert_eq!(file.state(), FileState::Opened);
        // And once it is open.
        assert_eq!(
            file.open(dir.join("b.bin"), mode).unwrap_err(),
            Error::InvalidArgument
        );
        Ok(())
    })
}

#[test]
fn seek_reports_positions_from_all_origins() -> TestResult {
    let dir = TestDir::new();
    with_test_env(|ctx| {
        let file = File::create(&ctx.handle(), 0);
        let mut mode = OpenMode::new();
        mode.read(true).write(true).create(true);
        file.open(dir.join("seek.bin"), mode)?;
        drive(ctx, 1)?;

        let mut buf = Buffer::create(32)?;
        buf.extend_from_slice(&[7u8; 32])?;
        file.write(buf, Some(0)).map_err(|(err, _)| err)?;
        drive(ctx, 1)?;
        assert_eq!(file.size()?, 32);

        let id = file.seek(8, SeekOrigin::Begin)?;
        let mut done = drive(ctx, 1)?;
        assert_eq!(take_completion(&mut done, id).unwrap().result(), Ok(8));

        let id = file.seek(4, SeekOrigin::Current)?;
        let mut done = drive(ctx, 1)?;
        assert_eq!(take_completion(&mut done, id).unwrap().result(), Ok(12));

        let id = file.seek(-6, SeekOrigin::End)?;
        let mut done = drive(ctx, 1)?;
        assert_eq!(take_completion(&mut done, id).unwrap().result(), Ok(26));

        // A current-position read picks up where the seek left off.
        let read_id = file
            .read(Buffer::create(64)?, None)
            .map_err(|(err, _)| err)?;
        let mut done = drive(ctx, 1)?;
        assert_eq!(
            take_completion(&mut done, read_id).unwrap().result(),
            Ok(6)
        );
        Ok(())
    })
}

#[test]
fn flush_completes_after_write() -> TestResult {
    let dir = TestDir::new();
    with_test_env(|ctx| {
        let file = File::create(&ctx.handle(), 0);
        let mut mode = OpenMode::new();
        mode.write(true).create(true);
        file.open(dir.join("flush.bin"), mode)?;
        drive(ctx, 1)?;

        let mut buf = Buffer::create(16)?;
        buf.extend_from_slice(b"durable")?;
        file.write(buf, Some(0)).map_err(|(err, _)| err)?;
        let flush_id = file.flush()?;
        let mut done = drive(ctx, 2)?;
        assert_eq!(take_completion(&mut done, flush_id).unwrap().result(), Ok(0));
        Ok(())
    })
}

#[test]
fn append_mode_appends() -> TestResult {
    let dir = TestDir::new();
    with_test_env(|ctx| {
        let file = File::create(&ctx.handle(), 0);
        let mut mode = OpenMode::new();
        mode.append(true).create(true);
        file.open(dir.join("log.txt"), mode)?;
        drive(ctx, 1)?;

        for _ in 0..2 {
            let mut buf = Buffer::create(8)?;
            buf.extend_from_slice(b"abc")?;
            file.write(buf, None).map_err(|(err, _)| err)?;
            drive(ctx, 1)?;
        }
        assert_eq!(file.size()?, 6);
        Ok(())
    })
}

#[test]
fn create_new_refuses_existing_path() -> TestResult {
    let dir = TestDir::new();
    with_test_env(|ctx| {
        let path = dir.join("once.bin");
        let mut mode = OpenMode::new();
        mode.write(true).create_new(true);

        let first = File::create(&ctx.handle(), 0);
        first.open(&path, mode)?;
        drive(ctx, 1)?;
        assert_eq!(first.state(), FileState::Opened);

        let second = File::create(&ctx.handle(), 0);
        let open_id = second.open(&path, mode)?;
        let mut done = drive(ctx, 1)?;
        let open = take_completion(&mut done, open_id).unwrap();
        assert_eq!(
            open.result().unwrap_err(),
            Error::Unknown {
                errno: libc::EEXIST
            }
        );
        assert_eq!(second.state(), FileState::Closed);
        Ok(())
    })
}

#[test]
fn close_releases_the_descriptor() -> TestResult {
    let dir = TestDir::new();
    with_test_env(|ctx| {
        let file = File::create(&ctx.handle(), 0);
        let mut mode = OpenMode::new();
        mode.write(true).create(true);
        file.open(dir.join("gone.bin"), mode)?;
        drive(ctx, 1)?;

        let close_id = file.close()?;
        // While the close is in flight everything is rejected.
        assert_eq!(file.flush().unwrap_err(), Error::BadFileDescriptor);

        let mut done = drive(ctx, 1)?;
        assert!(take_completion(&mut done, close_id)
            .unwrap()
            .result()
            .is_ok());
        assert_eq!(file.state(), FileState::Closed);
        assert_eq!(file.close().unwrap_err(), Error::BadFileDescriptor);
        let (err, _) = file.read(Buffer::create(8)?, None).unwrap_err();
        assert_eq!(err, Error::BadFileDescriptor);
        Ok(())
    })
}

#[test]
fn invalid_mode_is_rejected_before_queueing() -> TestResult {
    let dir = TestDir::new();
    with_test_env(|ctx| {
        let file = File::create(&ctx.handle(), 0);
        // Truncate without write access never reaches the ring.
        let mut mode = OpenMode::new();
        mode.read(true).truncate(true);
        assert_eq!(
            file.open(dir.join("x"), mode).unwrap_err(),
            Error::InvalidArgument
        );
        assert_eq!(ctx.pending(), 0);
        Ok(())
    })
}
