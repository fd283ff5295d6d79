//! Python source injected ahead of (or instead of) user code.

/// Locks the interpreter down before untrusted code runs: no `sys`, `os`,
/// `io`, `subprocess`, no `open`. Python-level stderr is rebound to
/// stdout.
pub const HARDENING: &str = "\
import sys
sys.stderr = sys.stdout
sys.modules['sys'] = None
sys.modules['os'] = None
sys.modules['_io'] = None
sys.modules['io'] = None
sys.modules['subprocess'] = None
del sys
del __builtins__.open
del __loader__
";

/// Prefix `source` with the hardening preamble.
pub fn hardened(source: &str) -> String {
    format!("{HARDENING}{source}")
}

/// Interactive console whose every stdin read first prints `token` (and the
/// prompt) on its own line, so the driver can tell "waiting for input" from
/// "still computing". The console is hardened like one-shot runs once its own
/// imports are done.
pub fn input_shim(token: &str) -> String {
    format!(
        "\
import builtins as _b, code as _code, sys as _sys
{HARDENING}_TOKEN = '{token}'
def _read_line(prompt=''):
    _sys.stdout.write(_TOKEN + str(prompt) + '\\n')
    _sys.stdout.flush()
    line = _sys.stdin.readline()
    if not line:
        raise EOFError
    return line.rstrip('\\n')
_b.input = _read_line
_console = _code.InteractiveConsole()
_console.raw_input = _read_line
del _b
_console.interact(banner='', exitmsg='')
"
    )
}
