//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Fake interactive shell
//!
//! Produces plausible output for a handful of reconnaissance commands and a
//! bash-style "command not found" for everything else. Nothing is ever
//! executed and the file system is a fixed fiction.

use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of one command line
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShellReply {
    /// Output lines, without terminators
    pub lines: Vec<String>,
    /// The client asked to end the session
    pub exit: bool,
}

impl ShellReply {
    fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            exit: false,
        }
    }

    fn exit() -> Self {
        Self {
            lines: vec!["logout".to_string()],
            exit: true,
        }
    }
}

const PASSWD: &[&str] = &[
    "root:x:0:0:root:/root:/bin/bash",
    "daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin",
    "bin:x:2:2:bin:/bin:/usr/sbin/nologin",
    "sys:x:3:3:sys:/dev:/usr/sbin/nologin",
    "www-data:x:33:33:www-data:/var/www:/usr/sbin/nologin",
    "sshd:x:110:65534::/run/sshd:/usr/sbin/nologin",
    "ubuntu:x:1000:1000:Ubuntu:/home/ubuntu:/bin/bash",
];

/// Shell state for one authenticated session
#[derive(Debug, Clone)]
pub struct FakeShell {
    user: String,
    hostname: String,
    cwd: String,
    extra: Arc<BTreeMap<String, String>>,
}

impl FakeShell {
    /// Start a shell in the user's home directory
    pub fn new(
        user: impl Into<String>,
        hostname: impl Into<String>,
        extra: Arc<BTreeMap<String, String>>,
    ) -> Self {
        let user = user.into();
        let cwd = home_of(&user);
        Self {
            user,
            hostname: hostname.into(),
            cwd,
            extra,
        }
    }

    /// Logged-in user
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Current directory
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    fn is_root(&self) -> bool {
        self.user == "root"
    }

    /// Prompt in the usual `user@host:dir$ ` form
    pub fn prompt(&self) -> String {
        let home = home_of(&self.user);
        let dir = match self.cwd.strip_prefix(&home) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => format!("~{}", rest),
            _ => self.cwd.clone(),
        };
        let sigil = if self.is_root() { '#' } else { '$' };
        format!("{}@{}:{}{} ", self.user, self.hostname, dir, sigil)
    }

    /// Run one command line
    pub fn execute(&mut self, line: &str) -> ShellReply {
        let line = line.trim();
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return ShellReply::default();
        };
        let args: Vec<&str> = words.collect();

        if let Some(output) = self.extra.get(command) {
            return ShellReply::lines(output.lines());
        }

        match command {
            "exit" | "logout" | "quit" => ShellReply::exit(),
            "whoami" => ShellReply::lines([self.user.clone()]),
            "id" => ShellReply::lines([self.id()]),
            "pwd" => ShellReply::lines([self.cwd.clone()]),
            "hostname" => ShellReply::lines([self.hostname.clone()]),
            "uname" => ShellReply::lines([self.uname(&args)]),
            "echo" => ShellReply::lines([args.join(" ")]),
            "ls" => self.ls(&args),
            "cd" => self.cd(args.first().copied()),
            "cat" => self.cat(&args),
            "w" | "uptime" => ShellReply::lines([
                " 10:14:03 up 12 days,  3:41,  1 user,  load average: 0.08, 0.03, 0.01",
            ]),
            "history" => ShellReply::default(),
            _ => ShellReply::lines([format!("-bash: {}: command not found", command)]),
        }
    }

    fn id(&self) -> String {
        if self.is_root() {
            "uid=0(root) gid=0(root) groups=0(root)".to_string()
        } else {
            format!(
                "uid=1000({0}) gid=1000({0}) groups=1000({0}),4(adm),27(sudo)",
                self.user
            )
        }
    }

    fn uname(&self, args: &[&str]) -> String {
        if args.iter().any(|a| a.starts_with('-') && a.contains('a')) {
            format!(
                "Linux {} 5.15.0-91-generic #101-Ubuntu SMP Tue Nov 14 13:30:08 UTC 2023 x86_64 x86_64 x86_64 GNU/Linux",
                self.hostname
            )
        } else {
            "Linux".to_string()
        }
    }

    fn ls(&self, args: &[&str]) -> ShellReply {
        let target = args
            .iter()
            .find(|a| !a.starts_with('-'))
            .map(|a| self.resolve(a))
            .unwrap_or_else(|| self.cwd.clone());
        let long = args.iter().any(|a| a.starts_with('-') && a.contains('l'));

        let entries: &[&str] = match target.as_str() {
            "/" => &[
                "bin", "boot", "dev", "etc", "home", "lib", "opt", "proc", "root", "run", "srv",
                "tmp", "usr", "var",
            ],
            "/etc" => &["hostname", "hosts", "passwd", "shadow", "ssh"],
            "/tmp" | "/var" => &[],
            dir if dir == home_of(&self.user) => &["backup.tar.gz", "notes.txt"],
            _ => {
                return ShellReply::lines([format!(
                    "ls: cannot access '{}': No such file or directory",
                    target
                )]);
            }
        };

        if long {
            let owner = &self.user;
            ShellReply::lines(
                std::iter::once(format!("total {}", entries.len() * 4)).chain(entries.iter().map(
                    |name| format!("-rw-r--r-- 1 {0} {0} 4096 Jan 12 09:41 {1}", owner, name),
                )),
            )
        } else if entries.is_empty() {
            ShellReply::default()
        } else {
            ShellReply::lines([entries.join("  ")])
        }
    }

    fn cd(&mut self, target: Option<&str>) -> ShellReply {
        let target = match target {
            None | Some("~") => home_of(&self.user),
            Some(dir) => self.resolve(dir),
        };
        let known = ["/", "/etc", "/tmp", "/var", "/root", "/home"];
        if known.contains(&target.as_str()) || target == home_of(&self.user) {
            self.cwd = target;
            ShellReply::default()
        } else {
            ShellReply::lines([format!("-bash: cd: {}: No such file or directory", target)])
        }
    }

    fn cat(&self, args: &[&str]) -> ShellReply {
        let mut lines = Vec::new();
        for file in args {
            match self.resolve(file).as_str() {
                "/etc/passwd" => lines.extend(PASSWD.iter().map(|l| l.to_string())),
                "/etc/hostname" => lines.push(self.hostname.clone()),
                "/etc/shadow" if !self.is_root() => {
                    lines.push("cat: /etc/shadow: Permission denied".to_string())
                }
                "/etc/shadow" => lines.push(
                    "root:$6$rounds=656000$Vd2x7Qp1$7nQ0m1y0n3Yb1Y2Q:19000:0:99999:7:::".to_string(),
                ),
                path => lines.push(format!("cat: {}: No such file or directory", path)),
            }
        }
        ShellReply { lines, exit: false }
    }

    /// Absolute, normalised form of `path` relative to the current directory
    fn resolve(&self, path: &str) -> String {
        let joined = if let Some(rest) = path.strip_prefix('~') {
            format!("{}{}", home_of(&self.user), rest)
        } else if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.cwd, path)
        };

        let mut parts: Vec<&str> = Vec::new();
        for part in joined.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                part => parts.push(part),
            }
        }
        format!("/{}", parts.join("/"))
    }
}

fn home_of(user: &str) -> String {
    if user == "root" {
        "/root".to_string()
    } else {
        format!("/home/{}", user)
    }
}
