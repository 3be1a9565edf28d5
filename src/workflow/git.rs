//! Git identity, repository initialization and working branch checkout.

use crate::error::{Error, Result};
use crate::process::{CommandOutput, RunCommandRequest};
use crate::sandbox::PROJECT_DIR;

use super::{failure_reason, generate_branch_name, Stage, WorkflowState};

const PLACEHOLDER_README: &str = "# Workspace\n\nInitialized for a coding agent session.\n";

/// Runs `git <args>` in the project directory; nonzero exit is an error.
async fn git<I, S>(stage: &Stage, args: I) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let request = RunCommandRequest::new("git").args(args);
    let line = request.command_line();
    let output = stage.run_in_project(request).await?;
    if !output.success() {
        return Err(Error::Git(format!("{}: {}", line, failure_reason(&output))));
    }
    Ok(output)
}

/// Runs `git <args>` and reports only whether it exited zero.
async fn probe<I, S>(stage: &Stage, args: I) -> Result<bool>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let output = stage
        .run_in_project(RunCommandRequest::new("git").args(args))
        .await?;
    Ok(output.success())
}

/// Sets the commit identity, initializing a repository first if the clone
/// didn't produce one.
pub(super) async fn configure(
    stage: &Stage,
    author_name: &str,
    author_email: &str,
    state: &WorkflowState,
) -> Result<()> {
    let inside = stage
        .run_in_project(RunCommandRequest::new("git").args(["rev-parse", "--is-inside-work-tree"]))
        .await?;
    let is_repo = inside.success() && inside.stdout().trim() != "false";

    if !is_repo {
        stage
            .logger
            .info("Project is not a git repository, initializing one")
            .await;
        git(stage, ["init"]).await?;
    }

    git(stage, ["config", "user.name", author_name]).await?;
    git(stage, ["config", "user.email", author_email]).await?;

    if !is_repo {
        create_main_branch(stage, state).await?;
    }

    stage.logger.success("Git configured").await;
    Ok(())
}

async fn create_main_branch(stage: &Stage, state: &WorkflowState) -> Result<()> {
    stage
        .sandbox
        .write_file(&format!("{}/README.md", PROJECT_DIR), PLACEHOLDER_README)
        .await
        .map_err(|e| Error::Git(format!("cannot write README.md: {}", e)))?;

    git(stage, ["add", "README.md"]).await?;
    git(stage, ["commit", "-m", "Initial commit"]).await?;
    git(stage, ["branch", "-M", "main"]).await?;

    let Some(url) = &state.clone_url else {
        return Ok(());
    };

    if let Err(e) = git(stage, ["remote", "add", "origin", url.expose()]).await {
        stage
            .logger
            .warn(&format!("Could not add remote, skipping push: {}", e))
            .await;
        return Ok(());
    }

    if let Err(e) = git(stage, ["push", "-u", "origin", "main"]).await {
        stage
            .logger
            .warn(&format!("Push of main failed, continuing with local repository: {}", e))
            .await;
    }
    Ok(())
}

/// Git invocations that check out `branch` from origin with tracking.
///
/// Shallow clones fetch only the default branch, so the branch is added to
/// origin's fetch refspecs first; otherwise `--track` has no upstream.
pub(super) fn remote_checkout_args(branch: &str) -> [Vec<String>; 3] {
    let owned = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
    let refspec = format!("refs/heads/{0}:refs/remotes/origin/{0}", branch);
    let upstream = format!("origin/{}", branch);
    [
        owned(&["remote", "set-branches", "--add", "origin", branch]),
        owned(&["fetch", "--depth", "1", "origin", refspec.as_str()]),
        owned(&["checkout", "-b", branch, "--track", upstream.as_str()]),
    ]
}

/// Checks out the working branch and returns its name.
///
/// A predetermined name is resolved local first, then remote, else created.
/// Without one a fresh `agent/...` branch is created.
pub(super) async fn prepare_branch(stage: &Stage, predetermined: Option<&str>) -> Result<String> {
    let Some(branch) = predetermined else {
        let branch = generate_branch_name();
        git(stage, ["checkout", "-b", branch.as_str()]).await?;
        stage
            .logger
            .success(&format!("Created branch {}", branch))
            .await;
        return Ok(branch);
    };

    let local_ref = format!("refs/heads/{}", branch);
    if probe(stage, ["show-ref", "--verify", "--quiet", local_ref.as_str()]).await? {
        git(stage, ["checkout", branch]).await?;
        stage
            .logger
            .success(&format!("Checked out existing branch {}", branch))
            .await;
        return Ok(branch.to_string());
    }

    if probe(stage, ["ls-remote", "--exit-code", "--heads", "origin", branch]).await? {
        for args in remote_checkout_args(branch) {
            git(stage, args).await?;
        }
        stage
            .logger
            .success(&format!("Checked out remote branch {}", branch))
            .await;
        return Ok(branch.to_string());
    }

    git(stage, ["checkout", "-b", branch]).await?;
    stage
        .logger
        .success(&format!("Created branch {}", branch))
        .await;
    Ok(branch.to_string())
}
