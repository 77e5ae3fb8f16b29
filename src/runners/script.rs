//! Job Script Generation
//!
//! Cluster jobs are submitted as bash scripts. The script exports the
//! job's environment, changes into the working directory, runs the
//! command and records its exit status in a file next to the logs, so
//! the result survives the scheduler forgetting the job.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use super::job::Job;

/// Writes an executable bash script for `job` to `script_path`.
pub fn create_job_script(job: &Job, script_path: &Path, status_path: &Path) -> io::Result<()> {
    let mut file = File::create(script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "# stage: {}", job.stage.replace('\n', " "))?;
    for (name, value) in &job.env {
        writeln!(file, "export {}={}", name, shell_quote(value))?;
    }

    let mut command_line = shell_quote(&job.command.program);
    for arg in &job.command.args {
        command_line.push(' ');
        command_line.push_str(&shell_quote(arg));
    }

    writeln!(
        file,
        "cd {} && {}",
        shell_quote(&job.working_dir.to_string_lossy()),
        command_line
    )?;
    writeln!(file, "exit_status=$?")?;
    writeln!(
        file,
        "echo $exit_status > {}",
        shell_quote(&status_path.to_string_lossy())
    )?;
    writeln!(file, "exit $exit_status")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(())
}

/// Quotes a word for bash unless it is made only of safe characters.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));

    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}
