pub mod configure;
pub mod poll;
pub mod read_registers;
pub mod safe_state;
pub mod write_atomic;

use crate::prelude::*;

use crate::modbus::{Request, Response};
use crate::register::RegisterDescriptor;

pub fn read_request(register: &RegisterDescriptor) -> Request {
    Request::ReadHolding {
        address: register.address,
        count: register.length(),
    }
}

pub fn decode_reply(register: &RegisterDescriptor, response: Response) -> Result<f64> {
    match response {
        Response::ReadHolding(words) => Ok(register.decode(&words)?),
        other => bail!("unexpected reply {:?} reading {}", other, register.name),
    }
}

/// Single register writes for one word, write-multiple for the 32-bit kinds.
pub fn write_request(register: &RegisterDescriptor, value: f64) -> Result<Request> {
    let words = register.encode(value)?;
    Ok(if words.len() == 1 {
        Request::WriteSingle {
            address: register.address,
            value: words[0],
        }
    } else {
        Request::WriteMultiple {
            address: register.address,
            values: words,
        }
    })
}
