#[cfg(unix)]
pub fn daemonize() -> anyhow::Result<()> {
    use daemonize::Daemonize;

    let daemonize = Daemonize::new()
        .pid_file("/tmp/mailrecv.pid")
        .chown_pid_file(true)
        .working_directory(".");

    daemonize
        .start()
        .map_err(|e| anyhow::anyhow!("daemon startup failed: {e}"))?;
    eprintln!("[INFO] mailrecv daemon started, pid {}", std::process::id());
    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize() -> anyhow::Result<()> {
    eprintln!("[INFO] Daemon mode is not supported on this platform, continuing in the foreground");
    Ok(())
}
