//! Request messages sent by the client

use bytes::Bytes;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::constants::{code_point as cp, secmec};
use crate::exception::{SqlException, SqlResult};
use crate::trace::mask;
use crate::types::{SqlType, Value};

use super::{read_objects, DdmObject};

/// Credentials sent in SECCHK, one variant per security mechanism
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// User id and clear-text password (`USRIDPWD`)
    UserPassword { user: String, password: String },
    /// User id only (`USRIDONL`)
    UserOnly { user: String },
    /// User id with a DES-encrypted password (`USRENCPWD`)
    EncryptedPassword { user: String, password: Vec<u8> },
    /// User id with a strong password substitute (`USRSSBPWD`)
    PasswordSubstitute { user: String, substitute: Vec<u8> },
    /// DES-encrypted user id and password (`EUSRIDPWD`)
    EncryptedUserPassword { user: Vec<u8>, password: Vec<u8> },
}

impl Credentials {
    /// Security mechanism code
    pub fn mechanism(&self) -> u16 {
        match self {
            Credentials::UserPassword { .. } => secmec::USRIDPWD,
            Credentials::UserOnly { .. } => secmec::USRIDONL,
            Credentials::EncryptedPassword { .. } => secmec::USRENCPWD,
            Credentials::PasswordSubstitute { .. } => secmec::USRSSBPWD,
            Credentials::EncryptedUserPassword { .. } => secmec::EUSRIDPWD,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::UserPassword { user, password } => f
                .debug_struct("UserPassword")
                .field("user", user)
                .field("password", &mask(password))
                .finish(),
            Credentials::UserOnly { user } => {
                f.debug_struct("UserOnly").field("user", user).finish()
            }
            Credentials::EncryptedPassword { user, password } => f
                .debug_struct("EncryptedPassword")
                .field("user", user)
                .field("password_len", &password.len())
                .finish(),
            Credentials::PasswordSubstitute { user, substitute } => f
                .debug_struct("PasswordSubstitute")
                .field("user", user)
                .field("substitute_len", &substitute.len())
                .finish(),
            Credentials::EncryptedUserPassword { user, password } => f
                .debug_struct("EncryptedUserPassword")
                .field("user_len", &user.len())
                .field("password_len", &password.len())
                .finish(),
        }
    }
}

/// A request the client can send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// EXCSAT: exchange server attributes
    ExchangeServerAttributes {
        external_name: String,
        server_name: String,
        product_release: String,
    },
    /// ACCSEC: propose a security mechanism, with the client token if any
    AccessSecurity {
        mechanism: u16,
        rdb_name: String,
        token: Option<Vec<u8>>,
    },
    /// SECCHK: present credentials
    SecurityCheck {
        rdb_name: String,
        credentials: Credentials,
    },
    /// ACCRDB: open the database
    AccessRdb { rdb_name: String, product_id: String },
    /// PRPSQLSTT: prepare SQL text into a package section
    Prepare { section: u16, sql: String },
    /// EXCSQLSTT: execute a prepared section
    Execute {
        section: u16,
        params: Vec<Value>,
        outputs: Vec<Option<SqlType>>,
    },
    /// RDBCMM: commit
    Commit,
    /// RDBRLLBCK: roll back
    Rollback,
}

impl Request {
    /// Code point of the command
    pub fn code_point(&self) -> u16 {
        match self {
            Request::ExchangeServerAttributes { .. } => cp::EXCSAT,
            Request::AccessSecurity { .. } => cp::ACCSEC,
            Request::SecurityCheck { .. } => cp::SECCHK,
            Request::AccessRdb { .. } => cp::ACCRDB,
            Request::Prepare { .. } => cp::PRPSQLSTT,
            Request::Execute { .. } => cp::EXCSQLSTT,
            Request::Commit => cp::RDBCMM,
            Request::Rollback => cp::RDBRLLBCK,
        }
    }

    /// Encode as DDM objects: the command followed by its data objects
    pub fn encode(&self) -> Bytes {
        let mut buf = WriteBuffer::new();
        buf.begin_ddm(self.code_point());
        match self {
            Request::ExchangeServerAttributes {
                external_name,
                server_name,
                product_release,
            } => {
                buf.write_ddm_param(cp::EXTNAM, external_name.as_bytes());
                buf.write_ddm_param(cp::SRVNAM, server_name.as_bytes());
                buf.write_ddm_param(cp::SRVRLSLV, product_release.as_bytes());
                buf.end_ddm();
            }
            Request::AccessSecurity {
                mechanism,
                rdb_name,
                token,
            } => {
                buf.write_ddm_u16(cp::SECMEC, *mechanism);
                buf.write_ddm_param(cp::RDBNAM, rdb_name.as_bytes());
                if let Some(token) = token {
                    buf.write_ddm_param(cp::SECTKN, token);
                }
                buf.end_ddm();
            }
            Request::SecurityCheck {
                rdb_name,
                credentials,
            } => {
                buf.write_ddm_u16(cp::SECMEC, credentials.mechanism());
                buf.write_ddm_param(cp::RDBNAM, rdb_name.as_bytes());
                match credentials {
                    Credentials::UserPassword { user, password } => {
                        buf.write_ddm_param(cp::USRID, user.as_bytes());
                        buf.write_ddm_param(cp::PASSWORD, password.as_bytes());
                    }
                    Credentials::UserOnly { user } => {
                        buf.write_ddm_param(cp::USRID, user.as_bytes());
                    }
                    Credentials::EncryptedPassword { user, password } => {
                        buf.write_ddm_param(cp::USRID, user.as_bytes());
                        buf.write_ddm_param(cp::SECTKN, password);
                    }
                    Credentials::PasswordSubstitute { user, substitute } => {
                        buf.write_ddm_param(cp::USRID, user.as_bytes());
                        buf.write_ddm_param(cp::SECTKN, substitute);
                    }
                    Credentials::EncryptedUserPassword { user, password } => {
                        buf.write_ddm_param(cp::SECTKN, user);
                        buf.write_ddm_param(cp::SECTKN, password);
                    }
                }
                buf.end_ddm();
            }
            Request::AccessRdb {
                rdb_name,
                product_id,
            } => {
                buf.write_ddm_param(cp::RDBNAM, rdb_name.as_bytes());
                buf.write_ddm_param(cp::PRDID, product_id.as_bytes());
                buf.end_ddm();
            }
            Request::Prepare { section, sql } => {
                buf.write_ddm_u16(cp::PKGSN, *section);
                buf.end_ddm();
                buf.write_ddm_param(cp::SQLSTT, sql.as_bytes());
            }
            Request::Execute {
                section,
                params,
                outputs,
            } => {
                buf.write_ddm_u16(cp::PKGSN, *section);
                buf.end_ddm();
                buf.begin_ddm(cp::SQLDTA);
                buf.begin_ddm(cp::FDODTA);
                buf.write_u16(params.len() as u16);
                for value in params {
                    value.encode(&mut buf);
                }
                buf.write_u16(outputs.len() as u16);
                for out in outputs {
                    buf.write_u8(out.map(|t| t as u8).unwrap_or(0));
                }
                buf.end_ddm();
                buf.end_ddm();
            }
            Request::Commit | Request::Rollback => buf.end_ddm(),
        }
        buf.freeze()
    }

    /// Decode a request, as a server would
    pub fn decode(data: Bytes) -> SqlResult<Self> {
        let objects = read_objects(data)?;
        let (command, rest) = objects
            .split_first()
            .ok_or_else(|| SqlException::protocol("empty request"))?;
        let params = command.params()?;
        let find = |code: u16| params.iter().find(|p| p.code_point == code);
        let text = |code: u16| find(code).map(DdmObject::as_string).unwrap_or_default();
        let required_u16 = |code: u16| -> SqlResult<u16> {
            find(code)
                .ok_or_else(|| {
                    SqlException::protocol(format!("missing parameter 0x{:04X}", code))
                })?
                .as_u16()
        };

        let request = match command.code_point {
            cp::EXCSAT => Request::ExchangeServerAttributes {
                external_name: text(cp::EXTNAM),
                server_name: text(cp::SRVNAM),
                product_release: text(cp::SRVRLSLV),
            },
            cp::ACCSEC => Request::AccessSecurity {
                mechanism: required_u16(cp::SECMEC)?,
                rdb_name: text(cp::RDBNAM),
                token: find(cp::SECTKN).map(|t| t.body.to_vec()),
            },
            cp::SECCHK => {
                let mechanism = required_u16(cp::SECMEC)?;
                let user = text(cp::USRID);
                let tokens: Vec<Vec<u8>> = params
                    .iter()
                    .filter(|p| p.code_point == cp::SECTKN)
                    .map(|p| p.body.to_vec())
                    .collect();
                let token = |i: usize| -> SqlResult<Vec<u8>> {
                    tokens
                        .get(i)
                        .cloned()
                        .ok_or_else(|| SqlException::protocol("SECCHK is missing SECTKN"))
                };
                let credentials = match mechanism {
                    secmec::USRIDPWD => Credentials::UserPassword {
                        user,
                        password: text(cp::PASSWORD),
                    },
                    secmec::USRIDONL => Credentials::UserOnly { user },
                    secmec::USRENCPWD => Credentials::EncryptedPassword {
                        user,
                        password: token(0)?,
                    },
                    secmec::USRSSBPWD => Credentials::PasswordSubstitute {
                        user,
                        substitute: token(0)?,
                    },
                    secmec::EUSRIDPWD => Credentials::EncryptedUserPassword {
                        user: token(0)?,
                        password: token(1)?,
                    },
                    other => {
                        return Err(SqlException::protocol(format!(
                            "unsupported security mechanism {}",
                            other
                        )))
                    }
                };
                Request::SecurityCheck {
                    rdb_name: text(cp::RDBNAM),
                    credentials,
                }
            }
            cp::ACCRDB => Request::AccessRdb {
                rdb_name: text(cp::RDBNAM),
                product_id: text(cp::PRDID),
            },
            cp::PRPSQLSTT => {
                let sql = rest
                    .iter()
                    .find(|o| o.code_point == cp::SQLSTT)
                    .ok_or_else(|| SqlException::protocol("PRPSQLSTT without SQLSTT"))?;
                Request::Prepare {
                    section: required_u16(cp::PKGSN)?,
                    sql: String::from_utf8_lossy(&sql.body).into_owned(),
                }
            }
            cp::EXCSQLSTT => {
                let data = rest
                    .iter()
                    .find(|o| o.code_point == cp::SQLDTA)
                    .ok_or_else(|| SqlException::protocol("EXCSQLSTT without SQLDTA"))?
                    .param(cp::FDODTA)?
                    .ok_or_else(|| SqlException::protocol("SQLDTA without FDODTA"))?;
                let mut buf = ReadBuffer::new(data.body);
                let count = buf.read_u16()? as usize;
                let mut params = Vec::with_capacity(count);
                for _ in 0..count {
                    params.push(Value::decode(&mut buf)?);
                }
                let out_count = buf.read_u16()? as usize;
                let mut outputs = Vec::with_capacity(out_count);
                for _ in 0..out_count {
                    outputs.push(SqlType::from_tag(buf.read_u8()?));
                }
                Request::Execute {
                    section: required_u16(cp::PKGSN)?,
                    params,
                    outputs,
                }
            }
            cp::RDBCMM => Request::Commit,
            cp::RDBRLLBCK => Request::Rollback,
            other => {
                return Err(SqlException::protocol(format!(
                    "unknown request code point 0x{:04X}",
                    other
                )))
            }
        };
        Ok(request)
    }
}
